//! Serve command: accept remote submissions.

use simpool_core::remote::{RemoteServer, ServerConfig};

use crate::colors;

pub async fn execute(listen: &str, command: Vec<String>) -> anyhow::Result<()> {
    let mut parts = command.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("serve needs a command to run"))?;
    let config = ServerConfig::new(program, parts.collect());

    let server = RemoteServer::bind(listen, config)?;
    println!(
        "{}Listening{} on {} (Ctrl-C to stop)",
        colors::BOLD,
        colors::RESET,
        server.local_addr()?
    );

    // Not spawn_blocking: runtime shutdown would wait on the accept loop.
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(server.serve());
    });
    tokio::select! {
        result = done_rx => result??,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}Stopped.{}", colors::YELLOW, colors::RESET);
        }
    }
    Ok(())
}
