use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use line_chat_server::{
    registry::Registry,
    server::Server,
    session::{PROMPT, SessionConfig},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, SessionConfig::default());
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    /// Connects, answers the prompt, and waits until the name is registered.
    async fn join(&self, name: &str) -> Result<Client> {
        let mut client = Client::connect(self.addr).await?;
        client.send_line(name).await?;
        self.wait_for(name).await?;
        Ok(client)
    }

    async fn wait_for(&self, name: &str) -> Result<()> {
        let registered = timeout(WAIT, async {
            while !self.registry.contains(name).await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if registered.is_err() {
            bail!("{name} was never registered");
        }
        Ok(())
    }

    async fn wait_for_absence(&self, name: &str) -> Result<()> {
        let removed = timeout(WAIT, async {
            while self.registry.contains(name).await {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if removed.is_err() {
            bail!("{name} was never removed");
        }
        Ok(())
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer };
        client.expect(PROMPT).await?;
        Ok(client)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, expected: &str) -> Result<()> {
        let mut buf = vec![0; expected.len()];
        timeout(WAIT, self.reader.read_exact(&mut buf)).await??;
        assert_eq!(String::from_utf8(buf)?, expected);
        Ok(())
    }

    async fn read_until_closed(&mut self) -> Result<String> {
        let mut rest = String::new();
        timeout(WAIT, self.reader.read_to_string(&mut rest)).await??;
        Ok(rest)
    }
}

#[tokio::test]
async fn alice_and_bob_chat_list_and_leave() -> Result<()> {
    let server = TestServer::start().await?;

    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    alice.expect("> bob: joined the chat\n").await?;

    alice.send_line("hello").await?;
    bob.expect("> alice: hello\n").await?;

    bob.send_line("/users").await?;
    bob.expect("Connected users:\n").await?;
    let mut listing = vec![0; "- alice\n- bob\n".len()];
    timeout(WAIT, bob.reader.read_exact(&mut listing)).await??;
    let listing = String::from_utf8(listing)?;
    let mut names: Vec<_> = listing.lines().collect();
    names.sort();
    assert_eq!(names, ["- alice", "- bob"]);

    alice.send_line("/quit").await?;
    bob.expect("> alice: left the chat\n").await?;
    // Alice never saw her own message echoed back.
    assert_eq!(alice.read_until_closed().await?, "");
    server.wait_for_absence("alice").await?;

    let mut alice_again = server.join("alice").await?;
    bob.expect("> alice: joined the chat\n").await?;
    assert_eq!(server.registry.len().await, 2);

    alice_again.send_line("/quit").await?;
    bob.send_line("/quit").await?;
    assert_eq!(alice_again.read_until_closed().await?, "");
    server.stop().await;

    Ok(())
}

#[tokio::test]
async fn duplicate_username_is_turned_away() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.join("alice").await?;

    let mut imposter = Client::connect(server.addr).await?;
    imposter.send_line("alice").await?;
    assert_eq!(
        imposter.read_until_closed().await?,
        "Username already taken\n"
    );
    assert_eq!(server.registry.names().await, ["alice"]);

    // The rejected connection never joined, so alice hears nothing about it.
    alice.send_line("/quit").await?;
    assert_eq!(alice.read_until_closed().await?, "");
    server.stop().await;

    Ok(())
}

#[tokio::test]
async fn dropped_connection_is_cleaned_up() -> Result<()> {
    let server = TestServer::start().await?;
    let mut watcher = server.join("watcher").await?;
    let quitter = server.join("quitter").await?;
    watcher.expect("> quitter: joined the chat\n").await?;

    drop(quitter);

    watcher.expect("> quitter: left the chat\n").await?;
    server.wait_for_absence("quitter").await?;
    assert_eq!(server.registry.len().await, 1);
    server.stop().await;

    Ok(())
}

#[tokio::test]
async fn many_clients_each_receive_every_other_message() -> Result<()> {
    let server = TestServer::start().await?;
    let mut clients: Vec<Client> = Vec::new();
    for index in 0..5 {
        let name = format!("user{index}");
        let client = server.join(&name).await?;
        let announcement = format!("> {name}: joined the chat\n");
        for existing in clients.iter_mut() {
            existing.expect(&announcement).await?;
        }
        clients.push(client);
    }

    clients[2].send_line("ping").await?;
    for (index, client) in clients.iter_mut().enumerate() {
        if index != 2 {
            client.expect("> user2: ping\n").await?;
        }
    }

    for client in clients.iter_mut() {
        client.send_line("/quit").await?;
    }
    server.stop().await;

    Ok(())
}
