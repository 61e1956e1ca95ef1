//! Lists the kernelspecs and running kernels known to a Jupyter server.

use std::sync::Arc;
use std::time::Duration;

use jupyter_client::config::ClientConfig;
use jupyter_client::rest::{JupyterRestClient, ReqwestTransport};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let base_url = std::env::args().nth(1).unwrap_or_else(|| "http://localhost:8888/".into());
    let config = ClientConfig::new(base_url.clone());

    let transport = ReqwestTransport::new(
        config.base_url.parse().expect("valid base URL"),
        config.token.as_deref(),
        config.xsrf_token.as_deref(),
        Duration::from_secs(10),
    )
    .expect("build REST transport");
    let rest = JupyterRestClient::new(Arc::new(transport));

    let specs = rest.kernelspecs().await.expect("fetch kernelspecs");
    println!("Available kernelspecs (default: {}):", specs.default);
    for (name, entry) in &specs.kernelspecs {
        println!("  {:20} {}", name, entry.spec.display_name);
    }

    let running = rest.list_kernels().await.expect("fetch running kernels");
    println!("\nRunning kernels:");
    if running.is_empty() {
        println!("  (none)");
    }
    for kernel in running {
        println!("  {:36} {} [{}]", kernel.id, kernel.name, kernel.execution_state);
    }
}
