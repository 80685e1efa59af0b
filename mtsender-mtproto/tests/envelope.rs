use mtsender_mtproto::envelope::{self, Envelope, ID_MSG_CONTAINER, ID_RPC_ERROR, ID_RPC_RESULT};
use mtsender_mtproto::{Message, MessageId, Serializable};

fn rpc_result(req: u64, result: &[u8]) -> Vec<u8> {
    let mut b = Vec::new();
    ID_RPC_RESULT.serialize(&mut b);
    MessageId(req).serialize(&mut b);
    b.extend_from_slice(result);
    b
}

fn rpc_error(code: i32, message: &str) -> Vec<u8> {
    let mut b = Vec::new();
    ID_RPC_ERROR.serialize(&mut b);
    code.serialize(&mut b);
    message.serialize(&mut b);
    b
}

fn container(items: &[(u64, i32, Vec<u8>)]) -> Vec<u8> {
    let mut b = Vec::new();
    ID_MSG_CONTAINER.serialize(&mut b);
    (items.len() as i32).serialize(&mut b);
    for (id, seq, body) in items {
        MessageId(*id).serialize(&mut b);
        seq.serialize(&mut b);
        (body.len() as i32).serialize(&mut b);
        b.extend_from_slice(body);
    }
    b
}

#[test]
fn rpc_result_keeps_raw_body() {
    let items = envelope::parse(MessageId(100), 1, &rpc_result(1001, &[1, 2, 3, 4])).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(
        items[0].envelope,
        Envelope::RpcResult { req_msg_id: MessageId(1001), body: vec![1, 2, 3, 4] }
    );
    assert!(items[0].needs_ack());
}

#[test]
fn rpc_error_is_unwrapped() {
    let body = rpc_result(1001, &rpc_error(420, "FLOOD_WAIT_30"));
    let items = envelope::parse(MessageId(100), 1, &body).unwrap();
    assert_eq!(
        items[0].envelope,
        Envelope::RpcError { req_msg_id: MessageId(1001), code: 420, message: "FLOOD_WAIT_30".into() }
    );
}

#[test]
fn gzipped_result_is_inflated() {
    let payload: Vec<u8> = (0..2048u32).flat_map(|i| (i % 7).to_le_bytes()).collect();
    let packed = envelope::gzip_packed(&payload).unwrap();
    let items = envelope::parse(MessageId(100), 1, &rpc_result(8, &packed)).unwrap();
    assert_eq!(items[0].envelope, Envelope::RpcResult { req_msg_id: MessageId(8), body: payload });
}

#[test]
fn container_is_flattened_in_order() {
    let ack = envelope::msgs_ack(&[MessageId(4), MessageId(8)]);
    let res = rpc_result(12, &[9, 9, 9, 9]);
    let body = container(&[(200, 2, ack), (204, 3, res)]);

    let items = envelope::parse(MessageId(196), 0, &body).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].msg_id, MessageId(200));
    assert!(!items[0].needs_ack());
    assert_eq!(items[0].envelope, Envelope::Ack { msg_ids: vec![MessageId(4), MessageId(8)] });
    assert_eq!(items[1].msg_id, MessageId(204));
    assert!(items[1].needs_ack());
    assert!(matches!(items[1].envelope, Envelope::RpcResult { req_msg_id: MessageId(12), .. }));
}

#[test]
fn built_container_carries_ids_and_sequence_numbers() {
    let ack = Message::new(MessageId(400), 4, envelope::msgs_ack(&[MessageId(16)]));
    let req = Message::new(MessageId(404), 5, envelope::ping(77));
    let body = envelope::msg_container(&[ack.clone(), req.clone()]);

    assert_eq!(body, container(&[(400, 4, ack.body), (404, 5, req.body)]));
    let items = envelope::parse(MessageId(408), 6, &body).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!((items[0].msg_id, items[0].seq_no), (MessageId(400), 4));
    assert_eq!(items[0].envelope, Envelope::Ack { msg_ids: vec![MessageId(16)] });
    assert_eq!((items[1].msg_id, items[1].seq_no), (MessageId(404), 5));
}

#[test]
fn unknown_constructor_is_an_update() {
    let body = 0xdeadbeefu32.to_le_bytes().to_vec();
    let items = envelope::parse(MessageId(1), 1, &body).unwrap();
    assert_eq!(items[0].envelope, Envelope::Update { body });
}

#[test]
fn truncated_container_is_an_error() {
    let mut body = container(&[(200, 2, vec![1, 2, 3, 4])]);
    body.truncate(body.len() - 2);
    assert!(envelope::parse(MessageId(1), 0, &body).is_err());
}

#[test]
fn state_request_and_state_info() {
    let mut body = Vec::new();
    envelope::ID_MSGS_STATE_REQ.serialize(&mut body);
    vec![MessageId(40), MessageId(44), MessageId(48)].serialize(&mut body);
    let items = envelope::parse(MessageId(1), 1, &body).unwrap();
    assert_eq!(
        items[0].envelope,
        Envelope::StateRequest { msg_ids: vec![MessageId(40), MessageId(44), MessageId(48)] }
    );

    let info = envelope::msgs_state_info(MessageId(1), 3);
    assert_eq!(&info[..4], &envelope::ID_MSGS_STATE_INFO.to_le_bytes());
    assert_eq!(u64::from_le_bytes(info[4..12].try_into().unwrap()), 1);
    // bytes: len 3, then 1,1,1
    assert_eq!(&info[12..16], &[3, 1, 1, 1]);
}

#[test]
fn small_or_service_bodies_are_not_compressed() {
    let small = vec![0u8; 100];
    assert_eq!(envelope::gzip_if_smaller(true, small.clone()), small);

    let big = vec![0u8; 4096];
    assert_eq!(envelope::gzip_if_smaller(false, big.clone()), big);

    let packed = envelope::gzip_if_smaller(true, big.clone());
    assert!(packed.len() < big.len());
    assert_eq!(&packed[..4], &envelope::ID_GZIP_PACKED.to_le_bytes());
}

#[test]
fn ping_layout() {
    let p = envelope::ping(77);
    assert_eq!(&p[..4], &envelope::ID_PING.to_le_bytes());
    assert_eq!(i64::from_le_bytes(p[4..12].try_into().unwrap()), 77);
}
