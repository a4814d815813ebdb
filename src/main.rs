use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match pk500::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
