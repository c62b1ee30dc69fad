//! Loopback integration tests.
//!
//! These drive two queue pairs on the same device against each other and
//! therefore need an RDMA-capable NIC (physical or soft-RoCE). They are
//! ignored by default; run them with `cargo test -- --ignored` on a
//! machine with hardware.

use anyhow::Result;
use rcmux::{Context, Error, Mr, Pd, QpState, RcQp, RcQpConfig, StreamContext};

const MIB: usize = 1024 * 1024;

fn loopback_qps() -> Result<(Pd, RcQp, RcQp)> {
    let ctx = Context::open(None, 1, 0)?;
    let pd = Pd::new(ctx)?;
    let qp1 = RcQp::create(pd.clone(), RcQpConfig::default())?;
    let qp2 = RcQp::create(pd.clone(), RcQpConfig::default())?;
    qp1.bring_up(&qp2.handshake()?)?;
    qp2.bring_up(&qp1.handshake()?)?;
    Ok((pd, qp1, qp2))
}

fn loopback_pair() -> Result<(Pd, StreamContext, StreamContext)> {
    let (pd, qp1, qp2) = loopback_qps()?;
    Ok((pd, StreamContext::create(qp1)?, StreamContext::create(qp2)?))
}

fn mr_bytes(mr: &Mr) -> &[u8] {
    unsafe { std::slice::from_raw_parts(mr.addr(), mr.len()) }
}

fn mr_bytes_mut(mr: &Mr) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(mr.addr(), mr.len()) }
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn tiny_message_loopback() -> Result<()> {
    let (pd, tx, rx) = loopback_pair()?;
    let src = Mr::alloc(pd.clone(), 4096)?;
    let dst = Mr::alloc(pd, 4096)?;

    for (i, byte) in mr_bytes_mut(&src)[..255].iter_mut().enumerate() {
        *byte = (i + 1) as u8;
    }

    let sent = tx.send_region(7, &src, 0, 255);
    let recvd = rx.recv_region(7, &dst, 0, 255);
    sent.wait()?;
    recvd.wait()?;

    assert_eq!(&mr_bytes(&dst)[..255], &mr_bytes(&src)[..255]);
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn stream_independence() -> Result<()> {
    let (pd, tx, rx) = loopback_pair()?;
    let src = Mr::alloc(pd.clone(), 20 * MIB)?;
    let dst = Mr::alloc(pd, 20 * MIB)?;

    // Chunks 0..10 go out on stream 0, chunks 10..20 on stream 1.
    for chunk in 0..20 {
        mr_bytes_mut(&src)[chunk * MIB..(chunk + 1) * MIB].fill(chunk as u8 + 1);
    }

    // Sends on stream 0 before any recv exists anywhere.
    let sends0: Vec<_> = (0..10)
        .map(|i| tx.send_region(0, &src, i * MIB, MIB as u32))
        .collect();
    // Recvs on stream 1, then its sends, then the stream-0 recvs.
    let recvs1: Vec<_> = (0..10)
        .map(|i| rx.recv_region(1, &dst, i * MIB, MIB as u32))
        .collect();
    let sends1: Vec<_> = (0..10)
        .map(|i| tx.send_region(1, &src, (10 + i) * MIB, MIB as u32))
        .collect();
    let recvs0: Vec<_> = (0..10)
        .map(|i| rx.recv_region(0, &dst, (10 + i) * MIB, MIB as u32))
        .collect();

    for handle in sends0.iter().chain(&sends1).chain(&recvs0).chain(&recvs1) {
        handle.wait()?;
    }

    // Per-stream FIFO: the k-th recv on a stream observes the k-th send.
    for k in 0..10 {
        assert!(mr_bytes(&dst)[(10 + k) * MIB..(11 + k) * MIB]
            .iter()
            .all(|&b| b == k as u8 + 1));
        assert!(mr_bytes(&dst)[k * MIB..(k + 1) * MIB]
            .iter()
            .all(|&b| b == 10 + k as u8 + 1));
    }
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn zero_length_and_out_of_bounds_are_rejected() -> Result<()> {
    let (pd, tx, _rx) = loopback_pair()?;
    let src = Mr::alloc(pd, 4096)?;

    let zero = tx.send(0, src.addr() as u64, 0, src.lkey());
    assert!(matches!(zero.wait(), Err(Error::InvalidArgument(_))));

    let oob = tx.send_region(0, &src, 4000, 1024);
    assert!(matches!(oob.wait(), Err(Error::InvalidArgument(_))));
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn length_mismatch_is_fatal() -> Result<()> {
    let (pd, tx, rx) = loopback_pair()?;
    let src = Mr::alloc(pd.clone(), 4096)?;
    let dst = Mr::alloc(pd, 4096)?;

    let sent = tx.send_region(0, &src, 0, 1024);
    let recvd = rx.recv_region(0, &dst, 0, 512);

    // The pairing happens on the send side, which detects the mismatch.
    assert!(matches!(sent.wait(), Err(Error::TransportFailed(_))));

    // Subsequent submissions on the failed context are rejected outright.
    let after = tx.send_region(0, &src, 0, 1024);
    assert!(matches!(after.wait(), Err(Error::TransportFailed(_))));

    // The recv side never sees the write; destruction cancels its handle.
    drop(rx);
    assert!(matches!(recvd.wait(), Err(Error::Cancelled)));
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn destruction_drains_cleanly() -> Result<()> {
    let (pd, tx, rx) = loopback_pair()?;
    let src = Mr::alloc(pd.clone(), MIB)?;
    let dst = Mr::alloc(pd, MIB)?;

    let sends: Vec<_> = (0..1000)
        .map(|_| tx.send_region(0, &src, 0, 1024))
        .collect();
    let recvs: Vec<_> = (0..500)
        .map(|_| rx.recv_region(0, &dst, 0, 1024))
        .collect();

    // The first 500 pairs complete.
    for handle in sends.iter().take(500).chain(&recvs) {
        handle.wait()?;
    }

    drop(tx);
    drop(rx);

    // The unmatched 500 sends resolve to Cancelled.
    for handle in sends.iter().skip(500) {
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
    }
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn bring_up_is_idempotent() -> Result<()> {
    let (_pd, qp1, qp2) = loopback_qps()?;

    // A second bring-up with the same peer record is a silent success.
    qp1.bring_up(&qp2.handshake()?)?;
    assert_eq!(qp1.state()?, QpState::Rts);
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
#[allow(deprecated)]
fn v2_copy_path_roundtrip() -> Result<()> {
    use rcmux::HostMemCopy;
    use std::sync::Arc;

    let (pd, qp1, qp2) = loopback_qps()?;

    let tx_staging_send = Mr::alloc(pd.clone(), 128 * 4096)?;
    let tx_staging_recv = Mr::alloc(pd.clone(), 1024 * 4096)?;
    let rx_staging_send = Mr::alloc(pd.clone(), 128 * 4096)?;
    let rx_staging_recv = Mr::alloc(pd.clone(), 1024 * 4096)?;

    let tx = StreamContext::create_v2(qp1, tx_staging_send, tx_staging_recv, Arc::new(HostMemCopy))?;
    let rx = StreamContext::create_v2(qp2, rx_staging_send, rx_staging_recv, Arc::new(HostMemCopy))?;

    let src = Mr::alloc(pd.clone(), 4096)?;
    let dst = Mr::alloc(pd, 4096)?;
    mr_bytes_mut(&src)[..1024].fill(0x5a);

    // V2 has no readiness exchange: the recv must be outstanding first.
    let recvd = rx.recv_v2(3, dst.addr() as u64, 1024);
    std::thread::sleep(std::time::Duration::from_millis(50));
    let sent = tx.send_v2(3, src.addr() as u64, 1024);
    sent.wait()?;
    recvd.wait()?;

    assert!(mr_bytes(&dst)[..1024].iter().all(|&b| b == 0x5a));

    // V1 entry points are rejected on a V2 context.
    let wrong = tx.send(0, src.addr() as u64, 16, src.lkey());
    assert!(matches!(wrong.wait(), Err(Error::InvalidArgument(_))));
    Ok(())
}
