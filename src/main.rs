use std::io::Write;
use std::sync::Arc;

use quill::config::Config;
use quill::queue::RequestQueue;
use quill::request::Request;
use quill::RequestClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env from the binary's directory first (the host app may launch
    // us with any CWD), falling back to dotenvy's default search.
    if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.to_path_buf())) {
        let env_path = dir.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
        } else {
            dotenvy::dotenv().ok();
        }
    } else {
        dotenvy::dotenv().ok();
    }

    let config = Config::load();
    let max_concurrent = config.max_concurrent_requests;
    let stream = config.stream_response;
    let client = Arc::new(RequestClient::new(config));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--check") {
        let ok = client.test_connection().await;
        println!("{}", if ok { "endpoint reachable" } else { "endpoint unreachable" });
        std::process::exit(if ok { 0 } else { 1 });
    }

    let prompt = args.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: quill [--check] <prompt>");
    }

    let queue = RequestQueue::new(client, max_concurrent);

    let mut request = Request::new("cli-1", prompt);
    if stream {
        request = request.with_stream(Arc::new(|fragment: &str| {
            print!("{fragment}");
            let _ = std::io::stdout().flush();
        }));
    }

    match queue.enqueue(request).await {
        Ok(response) => {
            if stream {
                println!();
            } else {
                println!("{}", response.content);
            }
            if let Some(tokens) = response.tokens_used {
                tracing::info!(model = %response.model, tokens, "request complete");
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("request failed: {e}");
            anyhow::bail!("{}", e.user_message())
        }
    }
}
