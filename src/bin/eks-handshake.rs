use anyhow::Result;
use eks_handshake::app::application::run;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let code = run().await?;
    std::process::exit(code)
}
