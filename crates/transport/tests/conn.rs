use eyre::Result;
use rand::thread_rng;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use wyre_crypto::sha3::{Digest, Keccak256};
use wyre_crypto::SecretKey;
use wyre_transport::{Conn, Error, Secrets, MAX_FRAME_SIZE, MIN_SIZE_TO_COMPRESS};

const PING: u64 = 0x10;
const PONG: u64 = 0x11;

async fn handshaken_pair() -> Result<(Conn<DuplexStream>, Conn<DuplexStream>)> {
    let mut csprng = thread_rng();
    let dialer_key = SecretKey::random(&mut csprng);
    let listener_key = SecretKey::random(&mut csprng);
    let dialer_public = dialer_key.public_key();
    let listener_public = listener_key.public_key();

    let (dial_io, listen_io) = duplex(1 << 20);
    let mut dialer = Conn::new(dial_io, Some(listener_public));
    let mut listener = Conn::new(listen_io, None);

    let listen_side = tokio::spawn(async move {
        let remote = listener.handshake(&listener_key).await?;
        Ok::<_, Error>((listener, remote))
    });
    let seen_by_dialer = dialer.handshake(&dialer_key).await?;
    let (listener, seen_by_listener) = listen_side.await??;

    assert_eq!(seen_by_dialer, listener_public);
    assert_eq!(seen_by_listener, dialer_public);
    Ok((dialer, listener))
}

fn mirrored_secrets() -> (Secrets, Secrets) {
    let mut hash_a = Keccak256::new();
    hash_a.update(b"egress of a");
    let mut hash_b = Keccak256::new();
    hash_b.update(b"egress of b");

    let remote = SecretKey::random(&mut thread_rng()).public_key();
    let left = Secrets {
        aes: [0x42; 32],
        mac: [0x0a; 32],
        egress_mac: hash_a.clone(),
        ingress_mac: hash_b.clone(),
        remote,
    };
    let right = Secrets {
        aes: [0x42; 32],
        mac: [0x0a; 32],
        egress_mac: hash_b,
        ingress_mac: hash_a,
        remote,
    };
    (left, right)
}

#[tokio::test]
async fn test_handshake_then_ping_pong() -> Result<()> {
    let (mut dialer, mut listener) = handshaken_pair().await?;

    let sent = dialer.write(PING, b"ping").await?;
    assert_eq!(sent, 4);

    let (code, data, wire_size) = listener.read().await?;
    assert_eq!(code, PING);
    assert_eq!(&data[..], b"ping");
    assert_eq!(wire_size, 4);

    let _ = listener.write(PONG, b"pong").await?;
    let (code, data, _) = dialer.read().await?;
    assert_eq!(code, PONG);
    assert_eq!(&data[..], b"pong");

    Ok(())
}

#[tokio::test]
async fn test_messages_of_assorted_sizes_roundtrip() -> Result<()> {
    let (mut dialer, mut listener) = handshaken_pair().await?;

    for size in [0, 1, 15, 16, 17, 255, 4096] {
        let payload = vec![0xC3; size];
        let _ = dialer.write(0x2A, &payload).await?;

        let (code, data, wire_size) = listener.read().await?;
        assert_eq!(code, 0x2A);
        assert_eq!(&data[..], &payload[..]);
        assert_eq!(wire_size, size);
    }

    Ok(())
}

#[tokio::test]
async fn test_tampered_header_is_rejected() -> Result<()> {
    let err = tampered_read(2).await?;
    assert!(matches!(err, Error::BadHeaderMac));
    Ok(())
}

#[tokio::test]
async fn test_tampered_body_is_rejected() -> Result<()> {
    // offset 40 lands inside the encrypted body region (after the 16-byte
    // header and its 16-byte MAC)
    let err = tampered_read(40).await?;
    assert!(matches!(err, Error::BadFrameMac));
    Ok(())
}

/// Writes one frame, flips a single bit at `offset` on the wire and returns
/// the receiving side's error.
async fn tampered_read(offset: usize) -> Result<Error> {
    let (left_secrets, right_secrets) = mirrored_secrets();

    let (io, mut wire_out) = duplex(1 << 16);
    let mut sender = Conn::new(io, None);
    sender.init_with_secrets(left_secrets);
    let _ = sender.write(0x07, b"payload under test").await?;

    // header (16) + header MAC (16) + padded body (32) + frame MAC (16)
    let mut wire = vec![0; 80];
    wire_out.read_exact(&mut wire).await?;
    wire[offset] ^= 0x01;

    let (io, mut wire_in) = duplex(1 << 16);
    let mut receiver = Conn::new(io, None);
    receiver.init_with_secrets(right_secrets);
    wire_in.write_all(&wire).await?;

    Ok(receiver.read().await.unwrap_err())
}

#[tokio::test]
async fn test_compression_applies_above_the_threshold() -> Result<()> {
    let (mut dialer, mut listener) = handshaken_pair().await?;
    dialer.set_snappy(true);
    listener.set_snappy(true);

    // at the threshold: sent verbatim
    let payload = vec![0x11; MIN_SIZE_TO_COMPRESS];
    let sent = dialer.write(0x2A, &payload).await?;
    assert_eq!(sent as usize, payload.len());

    let (_, data, wire_size) = listener.read().await?;
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(wire_size, payload.len());

    // above it: compressed on the wire, restored on read
    let payload = vec![0x11; MIN_SIZE_TO_COMPRESS + 100];
    let sent = dialer.write(0x2A, &payload).await?;
    assert!((sent as usize) < payload.len());

    let (_, data, wire_size) = listener.read().await?;
    assert_eq!(&data[..], &payload[..]);
    assert_eq!(wire_size, sent as usize);

    Ok(())
}

#[tokio::test]
async fn test_oversize_write_leaves_the_connection_usable() -> Result<()> {
    let (mut dialer, mut listener) = handshaken_pair().await?;

    let err = dialer.write(0x01, &vec![0; MAX_FRAME_SIZE + 1]).await;
    assert!(matches!(err, Err(Error::MessageTooLarge)));

    // nothing reached the wire, so framing is still in sync
    let _ = dialer.write(PING, b"ping").await?;
    let (code, data, _) = listener.read().await?;
    assert_eq!(code, PING);
    assert_eq!(&data[..], b"ping");

    Ok(())
}
