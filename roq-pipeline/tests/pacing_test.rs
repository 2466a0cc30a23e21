//! Timing of the pacing stages under a paused tokio clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use roq_pipeline::{
    Attributes, FrameSpacerBuilder, Info, Processor, RateShaperBuilder, Writer, WriterFn,
};
use shared::error::Result;
use tokio::time::Instant;

type Log = Arc<Mutex<Vec<(Bytes, Instant)>>>;

fn recorder() -> (WriterFn<impl FnMut(Bytes, Attributes) -> Result<()> + Send>, Log) {
    let log: Log = Arc::new(Mutex::new(vec![]));
    let sink_log = Arc::clone(&log);
    let sink = WriterFn(move |buf: Bytes, _attributes: Attributes| {
        sink_log.lock()?.push((buf, Instant::now()));
        Ok(())
    });
    (sink, log)
}

fn packets(tag: u8, count: usize, size: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| {
            let mut p = vec![tag; size];
            p[1] = i as u8;
            Bytes::from(p)
        })
        .collect()
}

async fn write_batch(writer: &mut Box<dyn Writer>, bufs: Vec<Bytes>) -> Result<()> {
    match writer.as_multi_writer() {
        Some(multi) => multi.write_all(bufs, Attributes::new()).await,
        None => {
            for buf in bufs {
                writer.write(buf, Attributes::new()).await?;
            }
            Ok(())
        }
    }
}

// ============================================================================
// Frame spacer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_spacer_spreads_frame_over_fraction() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let info = Info::new(1280, 720, 30, 1);
    let (sink, log) = recorder();
    let mut spacer = FrameSpacerBuilder::new().build();
    let mut writer = spacer.link(Box::new(sink), &info)?;

    let t0 = Instant::now();
    write_batch(&mut writer, packets(1, 10, 100)).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let log = log.lock()?.clone();
    assert_eq!(log.len(), 10);
    let frame = info.frame_duration()?;
    for (i, (packet, at)) in log.iter().enumerate() {
        assert_eq!(packet[1], i as u8);
        assert!(*at - t0 < frame);
    }
    // 0.3 * 33.3ms spread across 10 packets
    let span = log[9].1 - log[0].1;
    assert!(span >= Duration::from_millis(9), "span {span:?}");
    assert!(span <= Duration::from_millis(10), "span {span:?}");

    spacer.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_spacer_flushes_backlog() -> Result<()> {
    let info = Info::new(1280, 720, 30, 1);
    let (sink, log) = recorder();
    let mut spacer = FrameSpacerBuilder::new().build();
    let mut writer = spacer.link(Box::new(sink), &info)?;

    let t0 = Instant::now();
    for tag in 1..=6u8 {
        write_batch(&mut writer, packets(tag, 2, 100)).await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let log = log.lock()?.clone();
    assert_eq!(log.len(), 12);
    let order: Vec<u8> = log.iter().map(|(p, _)| p[0]).collect();
    assert_eq!(order, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6]);

    // frames 2 and 3 go out with the tail of frame 1 without pacing
    let flushed = log[1].1;
    for (_, at) in &log[1..7] {
        assert_eq!(*at, flushed);
    }
    // six paced frames would take six frame durations
    assert!(log[11].1 - t0 < 3 * info.frame_duration()?);

    spacer.shutdown().await;
    Ok(())
}

// ============================================================================
// Rate shaper
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shaper_follows_target_rate() -> Result<()> {
    let info = Info::new(1280, 720, 30, 1);
    let (sink, log) = recorder();
    let mut shaper = RateShaperBuilder::new()
        .with_rate(800_000)
        .with_burst(1000 * 8)
        .build();
    let mut writer = shaper.link(Box::new(sink), &info)?;

    let t0 = Instant::now();
    // 100 kB at 800 kbit/s is one second of sending
    write_batch(&mut writer, packets(1, 100, 1000)).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let half = log.lock()?.len();
    assert!((45..=56).contains(&half), "sent {half} packets in 500ms");

    // doubling the rate finishes the remainder in about a quarter second
    shaper.set_target_rate(1_600_000);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let log = log.lock()?.clone();
    assert_eq!(log.len(), 100);
    assert!(log[99].1 - t0 < Duration::from_millis(850));

    shaper.shutdown().await;
    Ok(())
}
