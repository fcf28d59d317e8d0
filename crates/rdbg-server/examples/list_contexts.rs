//! Ask a running debugger for its contexts and version, then leave.
//!
//! ```text
//! RDBG_ADDR=127.0.0.1:8089 cargo run -p rdbg-server --example list_contexts
//! ```

use std::env;
use std::error::Error;
use std::time::Duration;

use rdbg_core::ControlRequest;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let addr = env::var("RDBG_ADDR").unwrap_or_else(|_| "127.0.0.1:8089".to_string());

    println!("Connecting to {}...", addr);
    let stream = TcpStream::connect(&addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // The server greets every client with the contexts list.
    print_next(&mut lines).await?;

    write_half
        .write_all(format!("{}\n", ControlRequest::GetVersion.as_str()).as_bytes())
        .await?;
    print_next(&mut lines).await?;

    write_half
        .write_all(format!("{}\n", ControlRequest::Exit.as_str()).as_bytes())
        .await?;
    Ok(())
}

async fn print_next<R>(lines: &mut tokio::io::Lines<R>) -> Result<(), Box<dyn Error>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match timeout(Duration::from_secs(2), lines.next_line()).await {
        Ok(Ok(Some(line))) => {
            let value: Value = serde_json::from_str(&line)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Ok(Ok(None)) => println!("server closed the connection"),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => println!("no reply within 2s"),
    }
    Ok(())
}
