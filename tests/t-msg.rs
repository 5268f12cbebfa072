mod common;

use strum::IntoEnumIterator;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tunsocks::msg::{
    Command, ControlChannel, ControlMessage, ControlReader, ControlSender, FRAME_LEN, MAGIC,
};
use tunsocks::{DecodeError, Error};

#[test]
fn encode_then_decode() {
    for command in Command::iter() {
        let msg = ControlMessage::new(command, 3);
        let frame = msg.encode();
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[..2], &MAGIC);
        assert_eq!(ControlMessage::decode(&frame), Ok(Some(msg)));
    }
}

#[test]
fn partial_frame_needs_more() {
    let frame = ControlMessage::connect_me(255).encode();
    for len in 0..FRAME_LEN {
        assert_eq!(ControlMessage::decode(&frame[..len]), Ok(None));
    }
}

#[test]
fn corrupt_fields_are_rejected() {
    let mut frame = ControlMessage::heartbeat().encode();
    frame[4] = 9;
    assert!(matches!(
        ControlMessage::decode(&frame),
        Err(DecodeError::BadChecksum { .. })
    ));

    // unknown command with a matching checksum
    let mut frame = ControlMessage::heartbeat().encode();
    frame[3] = 0x7f;
    frame[5] = !(frame[2].wrapping_add(0x7f).wrapping_add(frame[4]));
    assert_eq!(
        ControlMessage::decode(&frame),
        Err(DecodeError::UnknownCommand(0x7f))
    );

    let mut frame = ControlMessage::cleanup().encode();
    frame[2] = 2;
    frame[5] = !(2u8.wrapping_add(frame[3]).wrapping_add(frame[4]));
    assert_eq!(ControlMessage::decode(&frame), Err(DecodeError::BadVersion(2)));
}

#[test]
fn command_names() {
    assert_eq!(Command::ConnectMe.to_string(), "CONNECT_ME");
    assert_eq!(Command::Cleanup.to_string(), "CLEANUP");
    assert_eq!(Command::Heartbeat.to_string(), "HEARTBEAT");
}

#[tokio::test]
async fn reader_recovers_after_corrupt_frame() {
    let mut bytes = ControlMessage::connect_me(1).encode();
    bytes[5] ^= 0xff;
    bytes.extend(ControlMessage::connect_me(2).encode());

    let mut reader = ControlReader::new(&bytes[..]);
    assert!(matches!(
        reader.recv().await,
        Err(Error::Decode(DecodeError::BadChecksum { .. }))
    ));
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::connect_me(2));
    assert!(matches!(reader.recv().await, Err(Error::ControlClosed)));
}

#[tokio::test]
async fn reader_skips_garbage_once() {
    let mut bytes = vec![0x00, 0x13, 0xA5, 0x37];
    bytes.extend(ControlMessage::heartbeat().encode());
    bytes.extend(ControlMessage::cleanup().encode());

    let mut reader = ControlReader::new(&bytes[..]);
    match reader.recv().await {
        Err(Error::Decode(DecodeError::BadMagic { skipped })) => assert_eq!(skipped, 4),
        other => panic!("expected BadMagic, got {other:?}"),
    }
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::heartbeat());
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::cleanup());
}

#[tokio::test]
async fn cut_off_frame_costs_only_its_own_bytes() {
    // a sender died mid-frame and the next frame follows right away
    let mut bytes = ControlMessage::connect_me(1).encode()[..4].to_vec();
    bytes.extend(ControlMessage::heartbeat().encode());
    bytes.extend(ControlMessage::connect_me(7).encode());

    let mut reader = ControlReader::new(&bytes[..]);
    assert!(matches!(
        reader.recv().await,
        Err(Error::Decode(DecodeError::BadChecksum { .. }))
    ));
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::heartbeat());
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::connect_me(7));
    assert!(matches!(reader.recv().await, Err(Error::ControlClosed)));
}

#[tokio::test]
async fn garbage_split_across_reads_is_reported_once() {
    let first: [u8; 2] = [0x00, 0xA5];
    let second = [0u8; 4];
    let frame = ControlMessage::heartbeat().encode();
    let stream = (&first[..]).chain(&second[..]).chain(&frame[..]);

    let mut reader = ControlReader::new(stream);
    match reader.recv().await {
        Err(Error::Decode(DecodeError::BadMagic { skipped })) => assert_eq!(skipped, 6),
        other => panic!("expected BadMagic, got {other:?}"),
    }
    assert_eq!(reader.recv().await.unwrap(), ControlMessage::heartbeat());
    assert!(matches!(reader.recv().await, Err(Error::ControlClosed)));
}

#[tokio::test]
async fn truncated_frame_closes_channel() {
    let frame = ControlMessage::cleanup().encode();
    let mut reader = ControlReader::new(&frame[..4]);
    assert!(matches!(reader.recv().await, Err(Error::ControlClosed)));
}

#[tokio::test]
async fn concurrent_senders_never_interleave() {
    let (dialed, accepted) = common::tcp_pair().await;
    let (_read, write) = dialed.into_split();
    let sender = ControlSender::new(write);
    let mut channel = ControlChannel::new(accepted).unwrap();

    let mut tasks = Vec::new();
    for task in 0..8u8 {
        let sender = sender.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                sender.send(ControlMessage::connect_me(task)).await.unwrap();
            }
        }));
    }

    let mut counts = [0usize; 8];
    for _ in 0..800 {
        let msg = timeout(common::WAIT, channel.reader.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.command, Command::ConnectMe);
        counts[msg.count as usize] += 1;
    }
    assert_eq!(counts, [100; 8]);

    for task in tasks {
        task.await.unwrap();
    }
}
