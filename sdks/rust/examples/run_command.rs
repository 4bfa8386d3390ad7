//! Connect to a local broker, run one tracked command and print its output.
//!
//!   cargo run -p termbroker-client --example run_command -- murfi "ls -la"

use std::time::Duration;
use termbroker_client::{ClientConfig, ServerFrame, TerminalClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let session = args.next().unwrap_or_else(|| "default".to_string());
    let command = args.next().unwrap_or_else(|| "echo hello".to_string());
    let endpoint =
        std::env::var("BROKER_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

    let mut config = ClientConfig::new(&endpoint, session)?;
    if let Ok(token) = std::env::var("BROKER_TOKEN") {
        config = config.with_token(token);
    }

    let (client, mut frames) = TerminalClient::connect(config).await?;
    let printer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                ServerFrame::Output { data, .. } => print!("{data}"),
                ServerFrame::Error { error, .. } => eprintln!("error: {error}"),
                ServerFrame::Exit { exit_code, .. } => {
                    println!("[shell exited with {exit_code}]");
                    break;
                }
                _ => {}
            }
        }
    });

    let outcome = client
        .execute_command(command, Duration::from_secs(30))
        .await?;
    println!("\n[exit code {}]", outcome.exit_code);

    client.close();
    let _ = printer.await;
    Ok(())
}
