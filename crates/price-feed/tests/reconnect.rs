use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use market_core::Symbol;
use price_feed::{FeedConfig, PriceFeed};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn sym(s: &str) -> Symbol {
    Symbol::parse(s).unwrap()
}

fn trade(symbol: &str, price: f64) -> Message {
    Message::Text(
        serde_json::json!({
            "type": "trade",
            "data": [{"s": symbol, "p": price, "v": 1.0, "t": 1_700_000_000_000i64}]
        })
        .to_string(),
    )
}

/// Reads frames until `n` subscribe requests arrive; returns their symbols.
async fn read_subscriptions(ws: &mut WebSocketStream<TcpStream>, n: usize) -> Result<BTreeSet<String>> {
    let mut seen = BTreeSet::new();
    while seen.len() < n {
        let Some(msg) = ws.next().await else {
            anyhow::bail!("client went away after {} subscriptions", seen.len());
        };
        if let Message::Text(text) = msg? {
            let value: Value = serde_json::from_str(&text)?;
            if value["type"] == "subscribe" {
                seen.insert(value["symbol"].as_str().unwrap_or_default().to_string());
            }
        }
    }
    Ok(seen)
}

/// Scripted upstream. Each accepted connection runs the next script step and
/// reports the subscriptions it received.
struct MockUpstream {
    addr: SocketAddr,
    subscriptions: mpsc::UnboundedReceiver<BTreeSet<String>>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, subscriptions) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut connection = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                connection += 1;
                let tx = tx.clone();
                let step = connection;
                tokio::spawn(async move {
                    if let Err(err) = script(step, stream, tx).await {
                        tracing::warn!(error = %err, "mock upstream connection ended with error");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            subscriptions,
            handle,
        })
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn script(step: usize, stream: TcpStream, tx: mpsc::UnboundedSender<BTreeSet<String>>) -> Result<()> {
    let mut ws = accept_async(stream).await?;
    match step {
        1 => {
            let _ = tx.send(read_subscriptions(&mut ws, 2).await?);
            ws.send(Message::Text("{not json".into())).await?;
            ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;
            ws.send(trade("AAPL", 150.25)).await?;
            // The runtime subscribe arrives on the live socket, then the
            // connection drops.
            let _ = tx.send(read_subscriptions(&mut ws, 1).await?);
            ws.close(None).await?;
        }
        _ => {
            let _ = tx.send(read_subscriptions(&mut ws, 3).await?);
            ws.send(trade("MSFT", 310.5)).await?;
            while let Some(msg) = ws.next().await {
                if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_reconnect_resubscribes_current_symbol_set() -> Result<()> {
    let mut upstream = MockUpstream::spawn().await?;
    let feed = PriceFeed::new(
        FeedConfig::new(upstream.url(), None).with_backoff(Duration::from_millis(50)),
    );
    let cancel = CancellationToken::new();
    let (handle, mut ticks) = feed.connect(BTreeSet::from([sym("AAPL"), sym("MSFT")]), cancel.clone());

    let first = timeout(WAIT, ticks.next()).await?.expect("stream ended");
    assert_eq!(first.symbol, sym("AAPL"));
    assert_eq!(first.price, 150.25);
    assert_eq!(
        timeout(WAIT, upstream.subscriptions.recv()).await?,
        Some(set(&["AAPL", "MSFT"]))
    );

    handle.subscribe(sym("TSLA"));

    // Polling sends TSLA, the upstream hangs up, and after the backoff the
    // feed reconnects with all three symbols.
    let second = timeout(WAIT, ticks.next()).await?.expect("stream ended");
    assert_eq!(second.symbol, sym("MSFT"));
    assert_eq!(
        timeout(WAIT, upstream.subscriptions.recv()).await?,
        Some(set(&["TSLA"]))
    );
    assert_eq!(
        timeout(WAIT, upstream.subscriptions.recv()).await?,
        Some(set(&["AAPL", "MSFT", "TSLA"]))
    );

    cancel.cancel();
    assert!(timeout(WAIT, ticks.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_feed_never_connects() -> Result<()> {
    let mut upstream = MockUpstream::spawn().await?;
    let feed = PriceFeed::new(FeedConfig::new(upstream.url(), None));
    let cancel = CancellationToken::new();
    let (_handle, mut ticks) = feed.connect(BTreeSet::from([sym("AAPL")]), cancel.clone());

    cancel.cancel();
    assert!(timeout(WAIT, ticks.next()).await?.is_none());
    assert!(upstream.subscriptions.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_upstream_keeps_retrying_until_cancelled() -> Result<()> {
    // Bind then drop to get a port nothing listens on.
    let addr = TcpListener::bind(("127.0.0.1", 0)).await?.local_addr()?;
    let feed = PriceFeed::new(
        FeedConfig::new(format!("ws://{}", addr), None).with_backoff(Duration::from_millis(20)),
    );
    let cancel = CancellationToken::new();
    let (_handle, mut ticks) = feed.connect(BTreeSet::from([sym("AAPL")]), cancel.clone());

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    assert!(timeout(WAIT, ticks.next()).await?.is_none());
    canceller.await?;
    Ok(())
}

#[tokio::test]
async fn test_token_on_bare_url_handshakes() -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let (uri_tx, mut uri_rx) = mpsc::unbounded_channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(resp)
        })
        .await?;
        read_subscriptions(&mut ws, 1).await?;
        ws.send(trade("AAPL", 101.5)).await?;
        while let Some(msg) = ws.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
        anyhow::Ok(())
    });

    let feed = PriceFeed::new(
        FeedConfig::new(format!("ws://{}", addr), Some("secret".into()))
            .with_backoff(Duration::from_millis(50)),
    );
    let cancel = CancellationToken::new();
    let (_handle, mut ticks) = feed.connect(BTreeSet::from([sym("AAPL")]), cancel.clone());

    let tick = timeout(WAIT, ticks.next()).await?.expect("stream ended");
    assert_eq!(tick.symbol, sym("AAPL"));
    assert_eq!(tick.price, 101.5);
    assert_eq!(
        timeout(WAIT, uri_rx.recv()).await?,
        Some("/?token=secret".to_string())
    );

    cancel.cancel();
    assert!(timeout(WAIT, ticks.next()).await?.is_none());
    timeout(WAIT, server).await???;
    Ok(())
}
