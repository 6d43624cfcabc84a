// demos/rpc_memory.rs

//! Request/response on the in-memory broker.
//!
//! One bus serves `AddRequest`s, another sends them and waits for the
//! correlated `AddResponse`.
//!
//! Run with: cargo run --example rpc_memory

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mom_bus::{create_memory_transport, BusBuilder, BusError, Message, Result};

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i32,
    b: i32,
}

impl Message for AddRequest {
    fn type_name() -> std::borrow::Cow<'static, str> {
        "math.AddRequest".into()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    sum: i32,
}

impl Message for AddResponse {
    fn type_name() -> std::borrow::Cow<'static, str> {
        "math.AddResponse".into()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = BusBuilder::new(create_memory_transport("math-server")).build()?;
    let client = BusBuilder::new(create_memory_transport("math-client"))
        .request_timeout(Duration::from_secs(2))
        .build()?;

    server
        .respond(|req: AddRequest| {
            req.a
                .checked_add(req.b)
                .map(|sum| AddResponse { sum })
                .ok_or("overflow")
        })
        .await?;

    let resp: AddResponse = client.request(&AddRequest { a: 20, b: 22 }).await?;
    println!("20 + 22 = {}", resp.sum);

    match client
        .request::<_, AddResponse>(&AddRequest { a: i32::MAX, b: 1 })
        .await
    {
        Err(BusError::Responder(message)) => println!("i32::MAX + 1 failed remotely: {message}"),
        other => println!("unexpected: {other:?}"),
    }

    client.dispose().await;
    server.dispose().await;
    Ok(())
}
