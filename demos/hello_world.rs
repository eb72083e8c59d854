//! Minimal server: answers every request with a greeting until Ctrl-C.
//!
//! ```text
//! RUST_LOG=httpconn=debug cargo run --example hello_world [config.json]
//! curl -v http://127.0.0.1:8080/hello
//! ```

use httpconn::{Method, Request, Response, Server, ServerConfig, StatusCode};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("httpconn=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    let server = Server::with_config(config).await?;
    println!("Listening on http://{}", server.local_addr());

    server
        .run_until(
            |req: Request| async move {
                match req.method() {
                    Method::Get => Response::new(StatusCode::Ok)
                        .header("Content-Type", "text/plain; charset=utf-8")
                        .chunk("Hello from ")
                        .chunk(req.path().to_owned())
                        .chunk("\n"),
                    _ => Response::new(StatusCode::MethodNotAllowed).header("Allow", "GET"),
                }
            },
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
        )
        .await?;
    Ok(())
}
