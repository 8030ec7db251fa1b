//! End-to-end tests over a real queue pair.
//!
//! These need an RDMA device (or Soft-RoCE: `rdma link add rxe0 type rxe
//! netdev <if>`), so they are `#[ignore]`d by default; run with
//! `cargo test -- --ignored`.

use rdma_stream::{ConnConfig, ConnectionState, RdmaConnection};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

static NEXT_PORT: AtomicU16 = AtomicU16::new(18515);

fn test_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn read_exact(conn: &RdmaConnection, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = conn.read(&mut buf[filled..], true)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended early",
            ));
        }
        filled += n;
    }
    Ok(())
}

fn write_all(conn: &RdmaConnection, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = conn.write(buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
#[ignore] // Requires RDMA hardware or Soft RoCE
fn loopback_echo() -> io::Result<()> {
    init_logging();
    let addr = test_addr();

    let listener = RdmaConnection::new(ConnConfig::default());
    listener.listen(addr)?;

    let server = thread::spawn(move || -> io::Result<()> {
        let peer = listener.accept_sync()?;
        let mut buf = vec![0u8; 1 << 20];
        read_exact(&peer, &mut buf)?;
        write_all(&peer, &buf)?;
        peer.close();
        Ok(())
    });

    thread::sleep(Duration::from_millis(100));
    let client = RdmaConnection::new(ConnConfig::default());
    client.connect(addr)?;
    assert_eq!(client.state(), ConnectionState::Connected);

    let payload = patterned(1 << 20);
    write_all(&client, &payload)?;

    let mut echoed = vec![0u8; payload.len()];
    read_exact(&client, &mut echoed)?;
    assert_eq!(echoed, payload);

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().expect("server thread panicked")
}

#[test]
#[ignore] // Requires RDMA hardware or Soft RoCE
fn partial_writes_make_progress_through_small_ring() -> io::Result<()> {
    init_logging();
    let addr = test_addr();

    // A 64 KiB ring cannot hold the 1 MiB request: each write call must
    // accept a bounded chunk, and looping must still move all of it.
    let config = ConnConfig::default().with_ring_capacity(64 * 1024);

    let listener = RdmaConnection::new(config.clone());
    listener.listen(addr)?;

    let total = 1 << 20;
    let server = thread::spawn(move || -> io::Result<Vec<u8>> {
        let peer = listener.accept_sync()?;
        let mut buf = vec![0u8; total];
        read_exact(&peer, &mut buf)?;
        peer.close();
        Ok(buf)
    });

    thread::sleep(Duration::from_millis(100));
    let client = RdmaConnection::new(config);
    client.connect(addr)?;

    let payload = patterned(total);
    let first = client.write(&payload)?;
    assert!(first >= 1 && first <= 64 * 1024, "first write took {first}");
    write_all(&client, &payload[first..])?;
    client.close();

    let received = server.join().expect("server thread panicked")?;
    assert_eq!(received, payload);
    Ok(())
}

#[test]
#[ignore] // Requires RDMA hardware or Soft RoCE
fn wrap_boundary_payload_survives() -> io::Result<()> {
    init_logging();
    let addr = test_addr();

    let config = ConnConfig::default().with_ring_capacity(64 * 1024);
    let listener = RdmaConnection::new(config.clone());
    listener.listen(addr)?;

    // Chunks sized to land writes across the ring seam repeatedly.
    let chunk = 40 * 1024;
    let rounds = 8;
    let server = thread::spawn(move || -> io::Result<()> {
        let peer = listener.accept_sync()?;
        for round in 0..rounds {
            let mut buf = vec![0u8; chunk];
            read_exact(&peer, &mut buf)?;
            assert!(
                buf.iter().enumerate().all(|(i, &b)| b == ((i + round) % 251) as u8),
                "corruption in round {round}"
            );
            write_all(&peer, &[round as u8])?;
        }
        peer.close();
        Ok(())
    });

    thread::sleep(Duration::from_millis(100));
    let client = RdmaConnection::new(config);
    client.connect(addr)?;

    for round in 0..rounds {
        let payload: Vec<u8> = (0..chunk).map(|i| ((i + round) % 251) as u8).collect();
        write_all(&client, &payload)?;
        let mut ack = [0u8; 1];
        read_exact(&client, &mut ack)?;
        assert_eq!(ack[0], round as u8);
    }
    client.close();
    server.join().expect("server thread panicked")
}

#[test]
#[ignore] // Requires RDMA hardware or Soft RoCE
fn peer_close_surfaces_as_eof() -> io::Result<()> {
    init_logging();
    let addr = test_addr();

    let listener = RdmaConnection::new(ConnConfig::default());
    listener.listen(addr)?;

    let server = thread::spawn(move || -> io::Result<()> {
        let peer = listener.accept_sync()?;
        write_all(&peer, b"goodbye")?;
        peer.close();
        Ok(())
    });

    thread::sleep(Duration::from_millis(100));
    let client = RdmaConnection::new(ConnConfig::default());
    client.connect(addr)?;

    let mut buf = [0u8; 7];
    read_exact(&client, &mut buf)?;
    assert_eq!(&buf, b"goodbye");

    // The ring is drained and the peer is gone: a blocking read must
    // observe end of stream, not hang until the timeout.
    let n = client.read(&mut buf, true)?;
    assert_eq!(n, 0);
    assert_eq!(client.state(), ConnectionState::Closed);
    server.join().expect("server thread panicked")
}

#[test]
#[ignore] // Requires RDMA hardware or Soft RoCE
fn nonblocking_read_reports_no_data() -> io::Result<()> {
    init_logging();
    let addr = test_addr();

    let listener = RdmaConnection::new(ConnConfig::default());
    listener.listen(addr)?;
    let server = thread::spawn(move || -> io::Result<RdmaConnection> {
        listener.accept_sync()
    });

    thread::sleep(Duration::from_millis(100));
    let client = RdmaConnection::new(ConnConfig::default());
    client.connect(addr)?;

    let mut buf = [0u8; 16];
    let err = client.read(&mut buf, false).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    assert_eq!(client.state(), ConnectionState::Connected);

    let peer = server.join().expect("server thread panicked")?;
    peer.close();
    client.close();
    Ok(())
}
