use beppu_backend::{error::Result, run_server};

#[tokio::main]
async fn main() -> Result<()> {
    run_server().await
}
