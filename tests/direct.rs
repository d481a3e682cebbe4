#![allow(clippy::unwrap_used)]

mod common;

use common::{small_config, wait_for, Pair, TIMEOUT};
use rdma_messenger::{Buffer, RdmaError};

/// Registers a zeroed server sink of `len` bytes and waits until the client
/// learned about it.
fn server_sink(pair: &Pair, len: usize) -> (u64, Buffer) {
    let mut sink = pair.server.ctx.pool().alloc(len).unwrap();
    sink.write_bytes(&vec![0u8; len]).unwrap();
    sink.clear();
    let sink_id = pair.server_conn.register_direct(&sink).unwrap();
    assert_eq!(sink_id, sink.addr());
    assert!(wait_for(|| pair.client_conn.has_remote_sink(sink_id)));
    (sink_id, sink)
}

fn sink_bytes(sink: &Buffer, len: usize) -> Vec<u8> {
    let mut view = sink.clone();
    view.clear();
    view.advance_write(len).unwrap();
    view.to_vec()
}

#[test]
fn direct_write_lands_in_the_peer_sink() {
    let pair = Pair::connect(&small_config());
    let (sink_id, sink) = server_sink(&pair, 4096);

    let payload = b"written without the peer's cpu";
    let mut src = pair.client_buffer(payload);
    pair.client_conn.write(sink_id, &mut src).unwrap();
    assert_eq!(src.data_size(), 0, "read cursor advances past the write");
    assert_eq!(sink_bytes(&sink, payload.len()), payload);
    assert_eq!(pair.client_conn.stats().direct_writes, 1);
    // a plain write is not dispatched on the peer
    assert!(pair.server.recorder.data().is_empty());
}

#[test]
fn direct_read_fetches_the_peer_sink() {
    let pair = Pair::connect(&small_config());
    let (sink_id, sink) = server_sink(&pair, 256);
    let mut fill = sink.clone();
    fill.write_bytes(b"remote contents").unwrap();

    let mut dst = pair.client.ctx.pool().alloc(64).unwrap();
    pair.client_conn.read(sink_id, &mut dst, 15).unwrap();
    assert_eq!(dst.to_vec(), b"remote contents");

    let too_long = pair.client.ctx.pool().alloc(8).unwrap();
    let (tx, _rx) = oneshot::channel::<()>();
    let err = pair
        .client_conn
        .read_async(sink_id, too_long, 9, Box::new(move |_, _| drop(tx)))
        .unwrap_err();
    assert!(matches!(err, RdmaError::InvalidInput(_)));
}

#[test]
fn send_direct_dispatches_the_sink_on_the_peer() {
    let pair = Pair::connect(&small_config());
    let (sink_id, _sink) = server_sink(&pair, 1024);

    let src = pair.client_buffer(b"signalled payload");
    pair.client_conn.send_direct(42, sink_id, &src).unwrap();
    assert!(pair.server.recorder.wait_for_data(1));
    assert_eq!(
        pair.server.recorder.data(),
        vec![(42, b"signalled payload".to_vec())]
    );
    // the caller's handle keeps its cursors
    assert_eq!(src.to_vec(), b"signalled payload");
}

#[test]
fn async_write_reports_through_its_handler() {
    let pair = Pair::connect(&small_config());
    let (sink_id, sink) = server_sink(&pair, 128);
    let src = pair.client_buffer(&[7u8; 100]);
    let (tx, rx) = flume::bounded(1);
    pair.client_conn
        .write_async(
            sink_id,
            src,
            Box::new(move |result, buf| {
                let _ignore = tx.send((result.is_ok(), buf.data_size()));
            }),
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (true, 0));
    assert_eq!(sink_bytes(&sink, 100), vec![7u8; 100]);
}

#[test]
fn unknown_sink_is_not_found() {
    let pair = Pair::connect(&small_config());
    let mut src = pair.client_buffer(b"nowhere");
    assert!(matches!(
        pair.client_conn.write(0xdead_0000, &mut src),
        Err(RdmaError::NotFound(_))
    ));
    assert!(matches!(
        pair.client_conn.send_direct(1, 0xdead_0000, &src),
        Err(RdmaError::NotFound(_))
    ));
    assert!(matches!(
        pair.client_conn.unregister_direct(0xdead_0000),
        Err(RdmaError::NotFound(_))
    ));
    assert_eq!(src.to_vec(), b"nowhere");
}

#[test]
fn unregistered_sink_is_forgotten_by_the_peer() {
    let pair = Pair::connect(&small_config());
    let (sink_id, _sink) = server_sink(&pair, 64);
    pair.server_conn.unregister_direct(sink_id).unwrap();
    assert!(wait_for(|| !pair.client_conn.has_remote_sink(sink_id)));

    let mut src = pair.client_buffer(b"late");
    assert!(matches!(
        pair.client_conn.write(sink_id, &mut src),
        Err(RdmaError::NotFound(_))
    ));
}
