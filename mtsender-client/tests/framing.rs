use mtsender_client::transport::ByteStream;
use mtsender_client::{Framing, TransportError};

#[test]
fn abridged_short_header_counts_words() {
    let framed = Framing::Abridged.encode(&[0u8; 8]).unwrap();
    assert_eq!(framed[0], 2);
    assert_eq!(framed.len(), 9);
    assert_eq!(Framing::Abridged.init_bytes(), &[0xef]);
}

#[test]
fn abridged_long_header_for_large_packets() {
    let payload = vec![0u8; 0x7f * 4];
    let framed = Framing::Abridged.encode(&payload).unwrap();
    assert_eq!(&framed[..4], &[0x7f, 0x7f, 0, 0]);
    assert_eq!(framed.len(), payload.len() + 4);
}

#[test]
fn abridged_rejects_unaligned_payloads() {
    for len in [1, 5, 25, 0x7f * 4 + 2] {
        let err = Framing::Abridged.encode(&vec![9u8; len]).unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)), "length {len}");
    }
    // Intermediate counts bytes, so any length goes.
    assert_eq!(Framing::Intermediate.encode(&[9u8; 25]).unwrap().len(), 29);
}

#[test]
fn intermediate_header_is_byte_length() {
    let framed = Framing::Intermediate.encode(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert_eq!(&framed[..4], &8u32.to_le_bytes());
    assert_eq!(Framing::Intermediate.init_bytes(), &[0xee; 4]);
}

#[tokio::test]
async fn packets_are_read_back_across_socket_messages() {
    for framing in [Framing::Abridged, Framing::Intermediate] {
        let (stream, feed, _out) = ByteStream::detached();
        let big: Vec<u8> = (0..1024u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut wire = framing.encode(&[1, 2, 3, 4]).unwrap();
        wire.extend(framing.encode(&big).unwrap());

        let (a, b) = wire.split_at(3);
        feed.push(a);
        feed.push(b);

        assert_eq!(framing.read_packet(&stream).await.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(framing.read_packet(&stream).await.unwrap(), big);
    }
}

#[tokio::test]
async fn zero_length_packet_is_a_framing_error() {
    let (stream, feed, _out) = ByteStream::detached();
    feed.push(&0u32.to_le_bytes());
    let err = Framing::Intermediate.read_packet(&stream).await.unwrap_err();
    assert!(matches!(err, TransportError::Framing(_)));
}
