use std::{
    error::Error,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
};
use tracing_subscriber::EnvFilter;
use wsrpc::{Endpoint, Role, Service};

#[derive(Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Serialize, Deserialize, Debug)]
struct Reply {
    sum: i64,
}

fn greeter(hello_served: Arc<Notify>) -> Service {
    Service::new("Greeter").method("Hello", move |name: String| {
        hello_served.notify_one();
        async move { Ok::<_, String>(format!("Hello, {name}!")) }
    })
}

/// Answers only after `greeted` fires, so the server getting a sum means the
/// client already has its greeting.
fn arith(greeted: Arc<Notify>) -> Service {
    Service::new("Arith").method("Add", move |Args { a, b }: Args| {
        let greeted = greeted.clone();
        async move {
            greeted.notified().await;
            Ok::<_, String>(Reply { sum: a + b })
        }
    })
}

async fn serve(listener: TcpListener) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (sock, _addr) = listener.accept().await?;
    let hello_served = Arc::new(Notify::new());
    let endpoint = Endpoint::builder()
        .service(greeter(hello_served.clone()))
        .connect(sock, Role::Server)
        .await?;

    // Call back once the client has said hello. The sum arrives after the
    // client read its greeting, so hanging up then loses nothing.
    hello_served.notified().await;
    let reply: Reply = endpoint.call("Arith.Add", &Args { a: 10, b: 15 }).await?;
    println!("server got {reply:?}");

    endpoint.close().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    let server = tokio::spawn(serve(listener));

    let greeted = Arc::new(Notify::new());
    let endpoint = Endpoint::builder()
        .service(arith(greeted.clone()))
        .connect(TcpStream::connect(addr).await?, Role::Client)
        .await?;

    let greeting: String = endpoint.call("Greeter.Hello", "world").await?;
    println!("client got {greeting:?}");
    greeted.notify_one();

    // Stay up for as long as the server keeps the connection.
    endpoint.done().await;
    endpoint.close().await;
    server.await??;
    Ok(())
}
