use log::{error, info, warn};
use onion_listener::{OnionListener, OnionListenerOptions, TorError};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

// Echo server on an onion service.
//
// Usage: onion-echo <options.json>
#[tokio::main]
async fn main() -> Result<(), TorError> {
    env_logger::init();

    let options_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: onion-echo <options.json>");
            std::process::exit(2);
        }
    };
    let options = OnionListenerOptions::from_json_file(&options_path)?;
    let mut listener = OnionListener::bind(options).await?;
    println!("onion echo server: listening on {}", listener.address()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        let (mut reader, mut writer) = stream.into_split();
                        if let Err(error) = tokio::io::copy(&mut reader, &mut writer).await {
                            warn!("Echo to {} failed: {}", peer, error);
                        }
                        let _ = writer.shutdown().await;
                    });
                }
                Err(error) => {
                    error!("Accept failed: {}", error);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    listener.close().await
}
