#[tokio::main]
async fn main() {
    dispatcher::start(std::env::args()).await;
}
