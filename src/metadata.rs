use crate::bencode::{self, Value};
use crate::config::Config;
use crate::scheduler::InfoHash;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddrV4;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

// BEP-9 metadata exchange against a single peer: BitTorrent handshake,
// extended handshake, ut_metadata piece requests, SHA-1 check of the
// assembled info dict.

const PROTOCOL: &[u8] = b"BitTorrent protocol";
const EXTENSION_MSG_ID: u8 = 20;
const EXT_HANDSHAKE_ID: u8 = 0;
const OUR_UT_METADATA_ID: i64 = 1;
pub const METADATA_PIECE_SIZE: usize = 16384;
const MAX_FRAME: usize = 2 * 1024 * 1024;
const MAX_PIECES: usize = 4096;
// Chatty peers front-load bitfield/have floods; give the extended handshake
// this many frames to show up before giving up on the peer.
const MAX_SKIPPED_FRAMES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connection refused")]
    ConnRefused,
    #[error("timed out")]
    Timeout,
    #[error("handshake failed")]
    Handshake,
    #[error("protocol failure: {0}")]
    Protocol(&'static str),
    #[error("metadata larger than limit")]
    TooLarge,
    #[error("metadata hash mismatch")]
    HashMismatch,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connect to `addr` and pull the complete info dict for `infohash`.
/// Returns the raw bencoded info dict bytes, SHA-1-verified.
pub async fn fetch(cfg: &Config, addr: SocketAddrV4, infohash: InfoHash) -> Result<Vec<u8>, FetchError> {
    let connect_timeout = Duration::from_secs(cfg.worker_connect_timeout_secs);
    let recv_timeout = Duration::from_secs(cfg.worker_recv_timeout_secs);

    let mut stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(FetchError::ConnRefused);
        }
        Ok(Err(err)) => return Err(FetchError::Io(err)),
        Err(_) => return Err(FetchError::Timeout),
    };

    bt_handshake(&mut stream, recv_timeout, &infohash).await?;
    let (ut_metadata_id, metadata_size) =
        extended_handshake(&mut stream, recv_timeout, cfg).await?;

    if metadata_size <= 0 {
        return Err(FetchError::Protocol("non-positive metadata_size"));
    }
    let metadata_size = metadata_size as usize;
    if metadata_size > cfg.worker_max_metadata_bytes {
        return Err(FetchError::TooLarge);
    }

    let piece_count = metadata_size.div_ceil(METADATA_PIECE_SIZE);
    if piece_count == 0 || piece_count > MAX_PIECES {
        return Err(FetchError::Protocol("implausible piece count"));
    }

    for piece in 0..piece_count {
        request_piece(&mut stream, ut_metadata_id, piece).await?;
    }

    let mut pieces: Vec<Option<Bytes>> = vec![None; piece_count];
    let mut missing = piece_count;
    while missing > 0 {
        let (id, payload) = read_message(&mut stream, recv_timeout).await?;
        if id != EXTENSION_MSG_ID || payload.is_empty() {
            continue;
        }
        let (sub_id, body) = (payload[0], &payload[1..]);
        if sub_id != OUR_UT_METADATA_ID as u8 {
            continue;
        }

        let (header, used) =
            bencode::decode_prefix(body).map_err(|_| FetchError::Protocol("bad piece header"))?;
        match header.get_int(b"msg_type") {
            Some(1) => {}
            Some(2) => return Err(FetchError::Protocol("metadata piece rejected")),
            // msg_type 0 is a request aimed at us; nothing to serve.
            _ => continue,
        }

        if let Some(total) = header.get_int(b"total_size") {
            if total != metadata_size as i64 {
                return Err(FetchError::Protocol("total_size changed mid-session"));
            }
        }

        let Some(index) = header
            .get_int(b"piece")
            .and_then(|p| usize::try_from(p).ok())
            .filter(|p| *p < piece_count)
        else {
            return Err(FetchError::Protocol("piece index out of range"));
        };

        let data = &body[used..];
        if data.len() != piece_size(index, piece_count, metadata_size) {
            return Err(FetchError::Protocol("bad piece length"));
        }
        if pieces[index].replace(Bytes::copy_from_slice(data)).is_none() {
            missing -= 1;
        }
    }

    let mut assembled = Vec::with_capacity(metadata_size);
    for piece in pieces.into_iter().flatten() {
        assembled.extend_from_slice(&piece);
    }

    let digest: [u8; 20] = Sha1::digest(&assembled).into();
    if digest != infohash {
        return Err(FetchError::HashMismatch);
    }
    Ok(assembled)
}

fn piece_size(index: usize, piece_count: usize, metadata_size: usize) -> usize {
    if index + 1 == piece_count {
        metadata_size - index * METADATA_PIECE_SIZE
    } else {
        METADATA_PIECE_SIZE
    }
}

async fn bt_handshake(
    stream: &mut TcpStream,
    recv_timeout: Duration,
    infohash: &InfoHash,
) -> Result<(), FetchError> {
    let mut packet = Vec::with_capacity(68);
    packet.push(PROTOCOL.len() as u8);
    packet.extend_from_slice(PROTOCOL);
    let mut reserved = [0u8; 8];
    reserved[5] |= 0x10; // BEP-10 extension protocol
    packet.extend_from_slice(&reserved);
    packet.extend_from_slice(infohash);
    packet.extend_from_slice(&crate::dht::random_node_id());
    stream.write_all(&packet).await?;

    let mut reply = [0u8; 68];
    read_exact_timed(stream, recv_timeout, &mut reply).await?;

    if reply[0] as usize != PROTOCOL.len() || &reply[1..20] != PROTOCOL {
        return Err(FetchError::Handshake);
    }
    if &reply[28..48] != infohash {
        return Err(FetchError::Handshake);
    }
    // reply[48..68] is the peer id; whatever it claims to be is fine.
    if reply[25] & 0x10 == 0 {
        return Err(FetchError::Protocol("peer lacks extension protocol"));
    }
    Ok(())
}

async fn extended_handshake(
    stream: &mut TcpStream,
    recv_timeout: Duration,
    cfg: &Config,
) -> Result<(u8, i64), FetchError> {
    let hello = Value::Dict(vec![
        (
            b"m".to_vec(),
            Value::Dict(vec![(b"ut_metadata".to_vec(), Value::Int(OUR_UT_METADATA_ID))]),
        ),
        (b"p".to_vec(), Value::Int(cfg.bind.port() as i64)),
        (b"v".to_vec(), Value::bytes(cfg.user_agent.as_bytes())),
    ]);
    let payload = bencode::encode(&hello).expect("static extended handshake");
    send_extended(stream, EXT_HANDSHAKE_ID, &payload).await?;

    // The peer's own extended handshake may trail a bitfield, haves or other
    // noise; skip frames until it shows up.
    for _ in 0..MAX_SKIPPED_FRAMES {
        let (id, payload) = read_message(stream, recv_timeout).await?;
        if id != EXTENSION_MSG_ID || payload.first() != Some(&EXT_HANDSHAKE_ID) {
            continue;
        }
        let dict = bencode::decode_prefix(&payload[1..])
            .map_err(|_| FetchError::Protocol("bad extended handshake"))?
            .0;
        let ut_id = dict
            .get(b"m")
            .and_then(|m| m.get_int(b"ut_metadata"))
            .and_then(|id| u8::try_from(id).ok())
            .filter(|id| *id != 0)
            .ok_or(FetchError::Protocol("peer does not advertise ut_metadata"))?;
        let size = dict
            .get_int(b"metadata_size")
            .ok_or(FetchError::Protocol("missing metadata_size"))?;
        return Ok((ut_id, size));
    }
    Err(FetchError::Protocol("no extended handshake"))
}

async fn request_piece(
    stream: &mut TcpStream,
    ut_metadata_id: u8,
    piece: usize,
) -> Result<(), FetchError> {
    let req = Value::Dict(vec![
        (b"msg_type".to_vec(), Value::Int(0)),
        (b"piece".to_vec(), Value::Int(piece as i64)),
    ]);
    let payload = bencode::encode(&req).expect("static piece request");
    send_extended(stream, ut_metadata_id, &payload).await
}

async fn send_extended(
    stream: &mut TcpStream,
    sub_id: u8,
    payload: &[u8],
) -> Result<(), FetchError> {
    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.extend_from_slice(&((payload.len() + 2) as u32).to_be_bytes());
    frame.push(EXTENSION_MSG_ID);
    frame.push(sub_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read one length-prefixed BT message, transparently skipping keep-alives.
/// Returns (message id, payload after the id byte).
async fn read_message(
    stream: &mut TcpStream,
    recv_timeout: Duration,
) -> Result<(u8, Vec<u8>), FetchError> {
    loop {
        let mut len_prefix = [0u8; 4];
        read_exact_timed(stream, recv_timeout, &mut len_prefix).await?;
        let len = u32::from_be_bytes(len_prefix) as usize;
        if len == 0 {
            continue; // keep-alive
        }
        if len > MAX_FRAME {
            return Err(FetchError::Protocol("oversized frame"));
        }
        let mut body = vec![0u8; len];
        read_exact_timed(stream, recv_timeout, &mut body).await?;
        let id = body[0];
        body.remove(0);
        return Ok((id, body));
    }
}

async fn read_exact_timed(
    stream: &mut TcpStream,
    recv_timeout: Duration,
    buf: &mut [u8],
) -> Result<(), FetchError> {
    match timeout(recv_timeout, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(FetchError::Protocol("peer closed mid-stream"))
        }
        Ok(Err(err)) => Err(FetchError::Io(err)),
        Err(_) => Err(FetchError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn test_config() -> Config {
        let mut cfg = Config::default_for_tests();
        cfg.worker_connect_timeout_secs = 2;
        cfg.worker_recv_timeout_secs = 2;
        cfg
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => panic!("expected v4 listener"),
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    async fn write_frame(stream: &mut TcpStream, body: &[u8]) {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.unwrap();
    }

    async fn accept_bt_handshake(stream: &mut TcpStream, echo_infohash: &[u8; 20]) {
        let mut hello = [0u8; 68];
        stream.read_exact(&mut hello).await.unwrap();
        let mut reply = hello;
        reply[28..48].copy_from_slice(echo_infohash);
        stream.write_all(&reply).await.unwrap();
    }

    async fn serve_extended_handshake(stream: &mut TcpStream, ut_id: i64, size: i64) {
        // Consume the crawler's extended handshake first.
        let _ = read_frame(stream).await;
        let dict = Value::Dict(vec![
            (
                b"m".to_vec(),
                Value::Dict(vec![(b"ut_metadata".to_vec(), Value::Int(ut_id))]),
            ),
            (b"metadata_size".to_vec(), Value::Int(size)),
        ]);
        let mut body = vec![EXTENSION_MSG_ID, EXT_HANDSHAKE_ID];
        body.extend_from_slice(&bencode::encode(&dict).unwrap());
        write_frame(stream, &body).await;
    }

    // Replies travel under the sub-id *we* advertised for ut_metadata.
    fn data_message(piece: usize, total: usize, chunk: &[u8]) -> Vec<u8> {
        let header = Value::Dict(vec![
            (b"msg_type".to_vec(), Value::Int(1)),
            (b"piece".to_vec(), Value::Int(piece as i64)),
            (b"total_size".to_vec(), Value::Int(total as i64)),
        ]);
        let mut body = vec![EXTENSION_MSG_ID, OUR_UT_METADATA_ID as u8];
        body.extend_from_slice(&bencode::encode(&header).unwrap());
        body.extend_from_slice(chunk);
        body
    }

    #[tokio::test]
    async fn rejects_wrong_infohash_in_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_bt_handshake(&mut stream, &[0xBB; 20]).await;
        });

        let err = fetch(&test_config(), addr, [0xAA; 20]).await.unwrap_err();
        assert!(matches!(err, FetchError::Handshake));
    }

    #[tokio::test]
    async fn fetches_and_verifies_multi_piece_metadata() {
        let metadata: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let infohash: [u8; 20] = Sha1::digest(&metadata).into();
        let expected = metadata.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_bt_handshake(&mut stream, &infohash).await;
            serve_extended_handshake(&mut stream, 3, metadata.len() as i64).await;

            for _ in 0..3 {
                let req = read_frame(&mut stream).await;
                assert_eq!(req[0], EXTENSION_MSG_ID);
                assert_eq!(req[1], 3);
                let header = bencode::decode(&req[2..]).unwrap();
                assert_eq!(header.get_int(b"msg_type"), Some(0));
                let piece = header.get_int(b"piece").unwrap() as usize;

                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                let body = data_message(piece, metadata.len(), &metadata[start..end]);
                write_frame(&mut stream, &body).await;
            }
        });

        let got = fetch(&test_config(), addr, infohash).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn hash_mismatch_discards_metadata() {
        let metadata = vec![7u8; 20_000];
        // Announce a hash the served bytes will not match.
        let infohash = [0x11; 20];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_bt_handshake(&mut stream, &infohash).await;
            serve_extended_handshake(&mut stream, 2, metadata.len() as i64).await;
            for _ in 0..2 {
                let req = read_frame(&mut stream).await;
                let header = bencode::decode(&req[2..]).unwrap();
                let piece = header.get_int(b"piece").unwrap() as usize;
                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                let body = data_message(piece, metadata.len(), &metadata[start..end]);
                write_frame(&mut stream, &body).await;
            }
        });

        let err = fetch(&test_config(), addr, infohash).await.unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch));
    }

    #[tokio::test]
    async fn reject_message_aborts_the_job() {
        let infohash = [0x22; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_bt_handshake(&mut stream, &infohash).await;
            serve_extended_handshake(&mut stream, 1, 30_000).await;
            let _ = read_frame(&mut stream).await;
            let header = Value::Dict(vec![
                (b"msg_type".to_vec(), Value::Int(2)),
                (b"piece".to_vec(), Value::Int(0)),
            ]);
            let mut body = vec![EXTENSION_MSG_ID, 1];
            body.extend_from_slice(&bencode::encode(&header).unwrap());
            write_frame(&mut stream, &body).await;
        });

        let err = fetch(&test_config(), addr, infohash).await.unwrap_err();
        assert!(matches!(err, FetchError::Protocol(_)));
    }

    #[tokio::test]
    async fn out_of_order_pieces_assemble_by_index() {
        let metadata: Vec<u8> = (0..METADATA_PIECE_SIZE as u32 + 100)
            .map(|i| (i % 7) as u8)
            .collect();
        let infohash: [u8; 20] = Sha1::digest(&metadata).into();
        let expected = metadata.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = v4(listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_bt_handshake(&mut stream, &infohash).await;
            serve_extended_handshake(&mut stream, 9, metadata.len() as i64).await;
            // Drain both requests, then answer in reverse order.
            let _ = read_frame(&mut stream).await;
            let _ = read_frame(&mut stream).await;
            for piece in [1usize, 0] {
                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                let body = data_message(piece, metadata.len(), &metadata[start..end]);
                write_frame(&mut stream, &body).await;
            }
        });

        let got = fetch(&test_config(), addr, infohash).await.unwrap();
        assert_eq!(got, expected);
    }
}
