//! The canine command line binary.

#[tokio::main]
async fn main() -> std::process::ExitCode {
    canine::canine_main().await
}
