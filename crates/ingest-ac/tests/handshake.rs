use std::time::Duration;

use sector_ingest_ac::{control_datagram, AcConfig, AcSource, Operation};
use sector_ingest_core::{channel, shutdown_channel, SourceEvent, TelemetrySource};
use tokio::net::UdpSocket;
use tokio::time::timeout;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn recv_control(game: &UdpSocket) -> Result<([u8; 12], std::net::SocketAddr), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(5), game.recv_from(&mut buf)).await??;
    let mut out = [0u8; 12];
    out.copy_from_slice(&buf[..len.min(12)]);
    Ok((out, from))
}

#[tokio::test]
async fn subscribes_streams_and_dismisses() -> TestResult {
    let game = UdpSocket::bind("127.0.0.1:0").await?;
    let cfg = AcConfig {
        listen: "127.0.0.1:0".into(),
        source: game.local_addr()?.to_string(),
        ..AcConfig::default()
    };
    let (tx, rx) = channel(64);
    let (stop, shutdown) = shutdown_channel();
    let mut source = AcSource::new(cfg);
    let task = tokio::spawn(async move { source.run(tx, shutdown).await });

    let (init, decoder_addr) = recv_control(&game).await?;
    assert_eq!(init, control_datagram(Operation::Init));

    // Handshake response: content is irrelevant to the decoder.
    game.send_to(&[0u8; 408], decoder_addr).await?;
    let (subscribe, _) = recv_control(&game).await?;
    assert_eq!(subscribe, control_datagram(Operation::SubscribeUpdate));

    let mut packet = vec![0u8; 328];
    packet[8..12].copy_from_slice(&150.0f32.to_le_bytes());
    packet[76..80].copy_from_slice(&4i32.to_le_bytes());
    game.send_to(&[1u8; 10], decoder_addr).await?; // undersized, dropped
    game.send_to(&packet, decoder_addr).await?;

    let event = tokio::task::spawn_blocking(move || {
        let ev = rx.recv_timeout(Duration::from_secs(5));
        (ev, rx)
    })
    .await?;
    let (event, rx) = event;
    match event? {
        SourceEvent::Sample(s) => {
            assert_eq!(s.fields.speed, Some(150.0));
            assert_eq!(s.fields.gear, Some(4));
            assert!(s.session_id.starts_with("ac-session-"));
        }
        other => return Err(format!("unexpected event {other:?}").into()),
    }

    stop.send(true)?;
    let (dismiss, _) = recv_control(&game).await?;
    assert_eq!(dismiss, control_datagram(Operation::Dismiss));
    timeout(Duration::from_secs(5), task).await???;

    assert!(matches!(rx.try_recv()?, SourceEvent::SessionEnded { .. }));
    Ok(())
}

#[tokio::test]
async fn bind_failure_is_an_error() -> TestResult {
    let taken = UdpSocket::bind("127.0.0.1:0").await?;
    let cfg = AcConfig { listen: taken.local_addr()?.to_string(), ..AcConfig::default() };
    let (tx, _rx) = channel(64);
    let (_stop, shutdown) = shutdown_channel();
    let res = AcSource::new(cfg).run(tx, shutdown).await;
    assert!(res.is_err());
    Ok(())
}

#[tokio::test]
async fn init_is_resent_until_answered() -> TestResult {
    let game = UdpSocket::bind("127.0.0.1:0").await?;
    let cfg = AcConfig {
        listen: "127.0.0.1:0".into(),
        source: game.local_addr()?.to_string(),
        handshake_retry: Duration::from_millis(50),
        ..AcConfig::default()
    };
    let (tx, _rx) = channel(64);
    let (stop, shutdown) = shutdown_channel();
    let mut source = AcSource::new(cfg);
    let task = tokio::spawn(async move { source.run(tx, shutdown).await });

    for _ in 0..3 {
        let (init, _) = recv_control(&game).await?;
        assert_eq!(init, control_datagram(Operation::Init));
    }

    stop.send(true)?;
    timeout(Duration::from_secs(5), task).await???;
    Ok(())
}

#[tokio::test]
async fn slow_pipeline_drops_samples_without_stalling() -> TestResult {
    let game = UdpSocket::bind("127.0.0.1:0").await?;
    let cfg = AcConfig {
        listen: "127.0.0.1:0".into(),
        source: game.local_addr()?.to_string(),
        ..AcConfig::default()
    };
    let (tx, rx) = channel(2);
    let (stop, shutdown) = shutdown_channel();
    let mut source = AcSource::new(cfg);
    let task = tokio::spawn(async move { source.run(tx, shutdown).await });

    let (_, decoder_addr) = recv_control(&game).await?;
    game.send_to(&[0u8; 408], decoder_addr).await?;
    recv_control(&game).await?;

    // Nobody reads `rx` while these arrive.
    let packet = vec![0u8; 328];
    for _ in 0..10 {
        game.send_to(&packet, decoder_addr).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The loop is still live: shutdown is honoured and DISMISS goes out.
    stop.send(true)?;
    let (dismiss, _) = recv_control(&game).await?;
    assert_eq!(dismiss, control_datagram(Operation::Dismiss));
    timeout(Duration::from_secs(5), task).await???;

    assert_eq!(rx.try_iter().count(), 2);
    Ok(())
}
