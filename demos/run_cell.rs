//! Starts a kernel on a running Jupyter server, executes one cell, and
//! prints its streamed output and final reply.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use jupyter_client::config::ClientConfig;
use jupyter_client::protocol::{ExecuteRequest, KernelMessageType, Reply};
use jupyter_client::rest::{JupyterRestClient, ReqwestTransport};
use jupyter_client::{KernelChannelEngine, TungsteniteFactory};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let base_url = std::env::args().nth(1).unwrap_or_else(|| "http://localhost:8888/".into());
    let config = ClientConfig::new(base_url);

    let transport = ReqwestTransport::new(
        config.base_url.parse().expect("valid base URL"),
        config.token.as_deref(),
        config.xsrf_token.as_deref(),
        Duration::from_secs(10),
    )
    .expect("build REST transport");
    let rest = JupyterRestClient::new(Arc::new(transport));

    let kernel = rest.start_kernel(None).await.expect("start kernel");
    println!("Started kernel {} ({})", kernel.id, kernel.name);

    let engine = KernelChannelEngine::new(
        Arc::new(TungsteniteFactory),
        rest.clone(),
        config,
        kernel.id.clone(),
        kernel.name.clone(),
    );

    let info = engine.kernel_info().await.expect("kernel_info_request");
    if let Reply::Ok(info) = info {
        println!("Kernel says hello: {}", info.banner);
    }

    print!("code> ");
    std::io::stdout().flush().unwrap();
    let mut code = String::new();
    std::io::stdin().read_line(&mut code).unwrap();

    let mut handle = engine
        .execute(ExecuteRequest {
            code,
            silent: false,
            store_history: true,
            user_expressions: Default::default(),
            allow_stdin: false,
            stop_on_error: true,
        })
        .expect("engine is alive");

    while let Some(msg) = handle.next_iopub().await {
        match msg.header.msg_type {
            KernelMessageType::Stream => {
                if let Ok(stream) = msg.into_typed::<jupyter_client::protocol::Stream>() {
                    print!("{}", stream.content.text);
                }
            }
            KernelMessageType::ExecuteResult => {
                if let Ok(result) = msg.into_typed::<jupyter_client::protocol::ExecuteResult>() {
                    if let Some(text) = result.content.data.get("text/plain").and_then(|v| v.as_str()) {
                        println!("-> {text}");
                    }
                }
            }
            KernelMessageType::Error => {
                if let Ok(err) = msg.into_typed::<jupyter_client::protocol::ErrorReply>() {
                    for line in &err.content.traceback {
                        println!("{line}");
                    }
                }
            }
            _ => {}
        }
    }

    match handle.reply().await.expect("execute_reply") {
        Reply::Ok(reply) => println!("\n[execution_count {}]", reply.execution_count),
        Reply::Error(err) => println!("\n[error: {}]", err.evalue),
        Reply::Abort => println!("\n[aborted]"),
    }

    engine.shutdown(false).await.expect("shutdown_request");
    rest.delete_kernel(&kernel.id).await.expect("delete kernel");
}
