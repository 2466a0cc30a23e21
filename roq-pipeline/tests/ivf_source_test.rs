//! IVF files streamed through the RTP stages and written back out.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use roq_pipeline::{
    Attributes, DataSourceBuilder, Info, IvfFileHeader, IvfReader, IvfSink, IvfSource, IvfWriter,
    Registry, RtpDepacketizerBuilder, RtpPacketizerBuilder, Writer,
};
use rtp::codec::Codec;
use shared::error::Result;
use tokio_util::sync::CancellationToken;

const INFO: Info = Info {
    width: 640,
    height: 480,
    timebase_num: 30,
    timebase_den: 1,
};

/// Hands every packet of the sending chain to the receiving chain.
struct Wire {
    receiver: Box<dyn Writer>,
}

#[async_trait]
impl Writer for Wire {
    async fn write(&mut self, buf: Bytes, attributes: Attributes) -> Result<()> {
        self.receiver.write(buf, attributes).await
    }
}

fn make_ivf(codec: Codec, frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut writer = IvfWriter::new(
        Cursor::new(Vec::<u8>::new()),
        IvfFileHeader::new(codec, &INFO),
    )?;
    let frame_us = INFO.frame_duration()?.as_micros() as i64;
    for (i, frame) in frames.iter().enumerate() {
        writer.write_frame(frame, Some(i as i64 * frame_us))?;
    }
    writer.close()?;
    Ok(writer.into_inner().into_inner())
}

fn read_ivf(buf: &[u8]) -> Result<(IvfFileHeader, Vec<(Bytes, u64)>)> {
    let (mut reader, header) = IvfReader::new(Cursor::new(buf))?;
    let frames = (0..header.num_frames)
        .map(|_| -> Result<(Bytes, u64)> {
            let (payload, frame_header) = reader.parse_next_frame()?;
            Ok((payload.freeze(), frame_header.timestamp))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((header, frames))
}

#[tokio::test(start_paused = true)]
async fn test_ivf_file_survives_rtp_round_trip() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let frames = (0..8)
        .map(|i| (0..1800 + i * 211).map(|b| (b * 7 + i) as u8).collect::<Vec<u8>>())
        .collect::<Vec<_>>();
    let source = IvfSource::new(Cursor::new(make_ivf(Codec::Vp9, &frames)?))?;
    let info = source.info();
    assert_eq!(info, INFO);

    let sink = IvfSink::new(Cursor::new(Vec::<u8>::new()), Codec::Vp9, &info)?;
    let mut depacketizer = RtpDepacketizerBuilder::new().with_codec(Codec::Vp9).build();
    let receiver = Registry::new(info)
        .with(&mut depacketizer)
        .build(Box::new(sink.clone()))?;

    let mut packetizer = RtpPacketizerBuilder::new().with_codec(Codec::Vp9).build();
    let sender = Registry::new(info)
        .with(&mut packetizer)
        .build(Box::new(Wire { receiver }))?;

    let written = source.run(sender, CancellationToken::new()).await?;
    assert_eq!(written, frames.len() as u64);

    tokio::time::sleep(Duration::from_millis(200)).await;
    depacketizer.shutdown().await;
    sink.close()?;

    let out = sink.with_output(|c| c.get_ref().clone())?;
    let (header, received) = read_ivf(&out)?;
    assert_eq!(&header.four_cc, b"VP90");
    assert_eq!(header.info(), INFO);
    assert_eq!(received.len(), frames.len());
    for (i, ((payload, timestamp), frame)) in received.iter().zip(&frames).enumerate() {
        assert_eq!(&payload[..], &frame[..], "frame {i}");
        assert_eq!(*timestamp, i as u64, "frame {i}");
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_data_source_chunks_into_ivf() -> Result<()> {
    let data = (0..5_000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
    let sink = IvfSink::new(Cursor::new(Vec::<u8>::new()), Codec::Vp8, &INFO)?;

    let mut source = DataSourceBuilder::new()
        .with_chunk_size(1_200)
        .with_rate(960_000)
        .build();
    let start = tokio::time::Instant::now();
    let sent = source
        .run_reader(
            Cursor::new(data.clone()),
            Box::new(sink.clone()),
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(sent, data.len() as u64);
    // the first chunk leaves on a full bucket, the next three 10ms apart
    assert!(start.elapsed() >= Duration::from_millis(30));
    sink.close()?;

    let out = sink.with_output(|c| c.get_ref().clone())?;
    let (_, chunks) = read_ivf(&out)?;
    assert_eq!(
        chunks.iter().map(|(c, _)| c.len()).collect::<Vec<_>>(),
        vec![1_200, 1_200, 1_200, 1_200, 200]
    );
    // chunks carry no pts, the sink numbers them
    assert_eq!(
        chunks.iter().map(|(_, ts)| *ts).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
    let copied = chunks
        .iter()
        .flat_map(|(c, _)| c.iter().copied())
        .collect::<Vec<u8>>();
    assert_eq!(copied, data);

    Ok(())
}
