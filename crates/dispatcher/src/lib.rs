//! Asynchronous classification dispatch service.
//!
//! Three long-lived loops share a Redis store: the [`dispatch::Dispatcher`]
//! submits pending tasks to the remote batch API, the
//! [`watcher::BatchWatcher`] drives in-flight batches to terminal task
//! states (writing outbox notifications in the same atomic step), and the
//! [`relay::Relay`] delivers those notifications as signed webhooks with
//! exponential backoff. An axum API accepts work and reports progress.

pub mod api;
pub mod arguments;
pub mod dispatch;
pub mod products;
pub mod relay;
pub mod shutdown;
pub mod watcher;

use {
    crate::{
        api::AppContext, arguments::Arguments, dispatch::Dispatcher, products::ProductFlow,
        relay::Relay, watcher::BatchWatcher,
    },
    batch_api::{BatchApi, HttpBatchApi},
    clap::Parser as _,
    observe::metrics::LivenessChecking,
    std::{sync::Arc, time::Duration},
    store::{Store, TtlSchedule},
    tokio::sync::watch,
};

/// Timeout of remote API calls. Webhook deliveries configure their own,
/// jittered timeout per request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing::initialize(&args.log_filter);
    observe::panic_hook::install();
    observe::metrics::setup_registry(Some("classification_dispatch".to_string()));
    tracing::info!("running dispatcher with {args}");
    run(args).await;
}

struct Liveness;

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        true
    }
}

pub async fn run(args: Arguments) {
    let ttls = TtlSchedule {
        pending: args.task_pending_ttl,
        completed: args.task_completed_ttl,
        failed: args.task_failed_ttl,
    };
    let store = Store::connect(args.store_url.as_str(), ttls)
        .await
        .expect("failed to connect to the store");

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap();
    let batch_api: Arc<dyn BatchApi> = Arc::new(HttpBatchApi::new(
        client.clone(),
        args.remote_api_base.clone(),
        args.remote_api_key.clone(),
        args.model.clone(),
        args.max_tokens,
    ));

    let dispatcher = Dispatcher::new(
        store.tasks(),
        batch_api.clone(),
        args.max_attempts,
        args.dispatch_batch_size,
        args.dispatch_concurrency,
        args.poll_interval,
    );
    let batch_watcher = BatchWatcher::new(
        store.tasks(),
        batch_api.clone(),
        args.batch_check_interval,
    );
    let relay = Relay::new(
        store.outbox(),
        reqwest::Client::new(),
        args.callback_url.to_string(),
        args.callback_secret.clone(),
        args.request_timeout,
        args.relay_batch_size,
        args.relay_concurrency,
        args.poll_interval,
    );

    let (stop_sender, stop) = watch::channel(false);
    let loops = vec![
        tokio::spawn(dispatcher.run_forever(stop.clone())),
        tokio::spawn(batch_watcher.run_forever(stop.clone())),
        tokio::spawn(relay.run_forever(stop.clone())),
    ];

    let ctx = Arc::new(AppContext {
        store: store.clone(),
        batch_api: batch_api.clone(),
        products: Arc::new(ProductFlow::new(store.product_batches(), batch_api)),
        api_key: args.api_key.clone(),
        callback_url: args.callback_url.to_string(),
        callback_secret: args.callback_secret.clone(),
        prompt_template: args.prompt_template.clone(),
    });
    tokio::task::spawn(api::serve(args.bind_address, ctx));
    tokio::task::spawn(observe::metrics::serve_metrics(
        Arc::new(Liveness),
        args.metrics_address,
    ));

    shutdown::signal_received().await;
    // Stop spawning new work and let the loops finish their current cycle;
    // anything unfinished is re-picked from the state queues on restart.
    let _ = stop_sender.send(true);
    for handle in loops {
        if let Err(err) = handle.await {
            tracing::error!(?err, "loop terminated abnormally");
        }
    }
    tracing::info!("shut down");
}
