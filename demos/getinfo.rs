//! Getinfo - connect to a node and print its identity.
//!
//! This example demonstrates:
//! - Connecting with `ClientBuilder::connect` and a connection string
//! - The typed `Session::getinfo` call
//! - Shutting the session down cleanly
//!
//! # Running
//!
//! ```text
//! LNLINK_RUNE=<rune> cargo run --example getinfo -- <node_id>@<host>[:port]
//! ```

use std::time::Duration;

use lnlink::ClientBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let address = std::env::args()
        .nth(1)
        .ok_or("usage: getinfo <node_id>@<host>[:port]")?;

    let session = ClientBuilder::new()
        .rune(std::env::var("LNLINK_RUNE").unwrap_or_default())
        .connect_timeout(Duration::from_secs(10))
        .connect(&address)?;

    let info = session.getinfo()?;
    println!("id:       {}", info.id);
    println!("alias:    {}", info.alias);
    println!("network:  {}", info.network);
    println!("peers:    {}", info.num_peers);
    println!("channels: {}", info.num_active_channels);
    println!("height:   {}", info.blockheight);
    println!("fees:     {} msat", info.fees_collected_msat.0);

    session.shutdown()?;
    Ok(())
}
