use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use mtsender_client::transport::{ByteStream, Outbound, SocketFeed};
use mtsender_client::{
    AuthKey, Client, Config, Connector, DcTarget, Framing, InMemoryBackend, NoRetries,
    RawCall, SessionBackend, SessionRecord, TransportError,
};
use mtsender_mtproto::envelope::{ID_MSGS_ACK, ID_PING, ID_PONG, ID_RPC_ERROR, ID_RPC_RESULT};
use mtsender_mtproto::{Message, MessageId, Serializable};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// The fake server's clock runs this many seconds ahead.
const SERVER_CLOCK_AHEAD: i64 = 30;

/// What a fake datacenter answers to one request body.
type Handler = Arc<dyn Fn(i32, usize, MessageId, &[u8]) -> Vec<u8> + Send + Sync>;

/// Hands out loopback streams served by `handler`, recording which
/// datacenters were dialed.
struct LoopbackConnector {
    handler: Handler,
    dialed:  Arc<Mutex<Vec<i32>>>,
}

impl Connector for LoopbackConnector {
    fn connect<'a>(
        &'a self,
        target:        &'a DcTarget,
        _test_servers: bool,
        _premium:      bool,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>> {
        self.dialed.lock().unwrap().push(target.id);
        let (stream, feed, out) = ByteStream::detached();
        tokio::spawn(serve(target.id, feed, out, Arc::clone(&self.handler)));
        Box::pin(async move { Ok(stream) })
    }
}

async fn serve(dc_id: i32, feed: SocketFeed, mut out: tokio::sync::mpsc::UnboundedReceiver<Outbound>, handler: Handler) {
    let mut served = 0;
    while let Some(Outbound::Binary(frame)) = out.recv().await {
        if frame.len() <= 4 {
            continue;
        }
        // Abridged, the default framing: one header byte below 0x7f.
        let packet = if frame[0] < 0x7f { &frame[1..] } else { &frame[4..] };
        let id  = MessageId(u64::from_le_bytes(packet[8..16].try_into().unwrap()));
        let len = u32::from_le_bytes(packet[16..20].try_into().unwrap()) as usize;
        let body = &packet[20..20 + len];
        if body[..4] == ID_MSGS_ACK.to_le_bytes() {
            continue;
        }
        let reply = handler(dc_id, served, id, body);
        served += 1;
        let packet = Message::new(server_id(SERVER_CLOCK_AHEAD), 0, reply).to_plaintext_bytes();
        feed.push(&Framing::Abridged.encode(&packet).unwrap());
    }
}

fn respond(f: impl Fn(i32, usize, MessageId, &[u8]) -> Vec<u8> + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

fn server_id(secs_ahead: i64) -> MessageId {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    MessageId((((now + secs_ahead) as u64) << 32) | 1)
}

fn rpc_result(req: MessageId, result: &[u8]) -> Vec<u8> {
    let mut b = Vec::new();
    ID_RPC_RESULT.serialize(&mut b);
    req.serialize(&mut b);
    b.extend_from_slice(result);
    b
}

fn rpc_error(req: MessageId, code: i32, message: &str) -> Vec<u8> {
    let mut err = Vec::new();
    ID_RPC_ERROR.serialize(&mut err);
    code.serialize(&mut err);
    message.serialize(&mut err);
    rpc_result(req, &err)
}

fn config(backend: Arc<dyn SessionBackend>, handler: Handler) -> (Config, Arc<Mutex<Vec<i32>>>) {
    let dialed = Arc::new(Mutex::new(Vec::new()));
    let config = Config {
        retry_policy:    Arc::new(NoRetries),
        resend_interval: None,
        session_backend: backend,
        connector:       Arc::new(LoopbackConnector { handler, dialed: Arc::clone(&dialed) }),
        ..Config::default()
    };
    (config, dialed)
}

fn call() -> RawCall {
    RawCall::new("users.getFullUser", vec![1, 0, 0, 0])
}

#[tokio::test]
async fn fresh_session_starts_on_the_default_dc() {
    let handler = respond(|_, _, id, _| rpc_result(id, &[9, 9, 9, 9]));
    let (config, dialed) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    assert_eq!(client.session().dc_id().unwrap(), 2);
    assert_eq!(*dialed.lock().unwrap(), vec![2]);
    assert_eq!(timeout(WAIT, client.invoke(&call())).await.unwrap().unwrap(), vec![9, 9, 9, 9]);
}

#[tokio::test]
async fn redirect_migrates_and_repeats_the_call() {
    let backend = Arc::new(InMemoryBackend::with_record(SessionRecord {
        dc:          Some(DcTarget::new(2, "149.154.167.51", 443)),
        auth_key:    Some(AuthKey::from_bytes([1u8; 256])),
        time_offset: 0,
    }));
    let handler = respond(|dc, _, id, _| match dc {
        2 => rpc_error(id, 303, "USER_MIGRATE_4"),
        _ => rpc_result(id, &[7, 7, 7, 7]),
    });
    let (config, dialed) = config(backend.clone(), handler);
    let client = Client::connect(config).await.unwrap();

    let result = timeout(WAIT, client.invoke(&call())).await.unwrap().unwrap();
    assert_eq!(result, vec![7, 7, 7, 7]);
    assert_eq!(*dialed.lock().unwrap(), vec![2, 4]);

    let session = client.session();
    assert_eq!(session.dc().unwrap(), DcTarget::new(4, "149.154.167.91", 443));
    assert!(session.auth_key().is_err());

    let stored = backend.load().unwrap().unwrap();
    assert_eq!(stored.dc.map(|d| d.id), Some(4));
}

#[tokio::test]
async fn endless_redirects_give_up() {
    let handler = respond(|dc, _, id, _| {
        let next = if dc == 2 { "USER_MIGRATE_4" } else { "USER_MIGRATE_2" };
        rpc_error(id, 303, next)
    });
    let (config, _) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    let err = timeout(WAIT, client.invoke(&call())).await.unwrap().unwrap_err();
    assert!(err.is("USER_MIGRATE"));
}

#[tokio::test(start_paused = true)]
async fn short_flood_wait_is_slept_through() {
    let handler = respond(|_, served, id, _| match served {
        0 => rpc_error(id, 420, "FLOOD_WAIT_3"),
        _ => rpc_result(id, &[4, 4, 4, 4]),
    });
    let (mut config, _) = config(Arc::new(InMemoryBackend::new()), handler);
    config.retry_policy = Arc::new(mtsender_client::AutoSleep::default());
    let client = Client::connect(config).await.unwrap();

    assert_eq!(client.invoke(&call()).await.unwrap(), vec![4, 4, 4, 4]);
}

#[tokio::test]
async fn errors_surface_without_a_retry_policy() {
    let handler = respond(|_, _, id, _| rpc_error(id, 400, "PEER_ID_INVALID"));
    let (config, _) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    let err = timeout(WAIT, client.invoke(&call())).await.unwrap().unwrap_err();
    assert!(err.is("PEER_ID_INVALID"));
    assert_eq!(err.kind(), Some(mtsender_client::ErrorKind::BadRequest));
}

#[tokio::test]
async fn pong_offset_lands_in_the_session() {
    let handler = respond(|_, _, id, body| {
        assert_eq!(body[..4], ID_PING.to_le_bytes());
        let mut pong = Vec::new();
        ID_PONG.serialize(&mut pong);
        id.serialize(&mut pong);
        pong.extend_from_slice(&body[4..12]);
        pong
    });
    let (config, _) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    timeout(WAIT, client.ping()).await.unwrap().unwrap();
    timeout(WAIT, async {
        while !(29..=31).contains(&client.session().time_offset().unwrap()) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn lost_connection_is_reopened_on_next_call() {
    let handler = respond(|_, _, id, _| rpc_result(id, &[2, 2, 2, 2]));
    let (config, dialed) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    client.sender().await.disconnect();
    assert_eq!(timeout(WAIT, client.invoke(&call())).await.unwrap().unwrap(), vec![2, 2, 2, 2]);
    assert_eq!(*dialed.lock().unwrap(), vec![2, 2]);
}

#[tokio::test]
async fn log_out_erases_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(mtsender_client::BinaryFileBackend::new(dir.path().join("s.session")));
    let handler = respond(|_, _, id, _| rpc_result(id, &[0; 4]));
    let (config, _) = config(backend.clone(), handler);
    let client = Client::connect(config).await.unwrap();

    client.save_session().await.unwrap();
    assert!(backend.load().unwrap().is_some());

    client.log_out().await.unwrap();
    assert!(backend.load().unwrap().is_none());
    assert!(!client.sender().await.is_connected());
}

#[tokio::test]
async fn update_stream_is_handed_out_once() {
    let handler = respond(|_, _, id, _| rpc_result(id, &[0; 4]));
    let (config, _) = config(Arc::new(InMemoryBackend::new()), handler);
    let client = Client::connect(config).await.unwrap();

    assert!(client.stream_updates().is_some());
    assert!(client.stream_updates().is_none());
}
