use bedside::core::transport::{Frame, RingReader, RingWriter, SharedRegion, VitalsFrame, FRAME_SIZE};
use bedside::error::TransportFault;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SLOTS: u32 = 8;

#[derive(Debug, Clone)]
enum Step {
    Publish,
    PublishCorrupt(usize),
    Poll(u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => Just(Step::Publish),
        1 => (0..FRAME_SIZE).prop_map(Step::PublishCorrupt),
        3 => (1u8..12).prop_map(Step::Poll),
    ]
}

fn vitals(sequence: u64) -> Frame {
    Frame::Vitals(VitalsFrame {
        sequence,
        timestamp_ns: sequence * 1_000_000,
        patient: 1,
        heart_rate: Some(60.0 + (sequence % 40) as f32),
        spo2: Some(97.0),
        respiration_rate: Some(14.0),
    })
}

proptest! {
    #[test]
    fn reader_never_yields_corrupt_or_reordered_frames(steps in prop::collection::vec(step(), 1..200)) {
        let region = Arc::new(SharedRegion::heap(SLOTS).unwrap());
        let mut writer = RingWriter::new(Arc::clone(&region));
        let mut reader = RingReader::new(region);

        // Index i carries sequence i + 1; corrupt entries are remembered.
        let mut corrupt = Vec::new();
        let mut last_sequence = 0u64;

        for step in steps {
            match step {
                Step::Publish => {
                    let sequence = writer.next_index() + 1;
                    writer.publish(&vitals(sequence), sequence);
                    corrupt.push(false);
                }
                Step::PublishCorrupt(byte) => {
                    let sequence = writer.next_index() + 1;
                    let mut bytes = [0u8; FRAME_SIZE];
                    vitals(sequence).encode(&mut bytes);
                    bytes[byte] ^= 0x5A;
                    writer.publish_raw(&bytes, sequence);
                    corrupt.push(true);
                }
                Step::Poll(times) => {
                    for _ in 0..times {
                        match reader.poll() {
                            Ok(Some(frame)) => {
                                let index = (frame.sequence() - 1) as usize;
                                prop_assert!(!corrupt[index], "corrupt frame {} delivered", index);
                                prop_assert!(frame.sequence() > last_sequence);
                                prop_assert_eq!(frame, vitals(frame.sequence()));
                                last_sequence = frame.sequence();
                            }
                            Ok(None) => break,
                            Err(TransportFault::ChecksumMismatch { index }) => {
                                prop_assert!(corrupt[index as usize]);
                            }
                            Err(TransportFault::FrameDropped { skipped }) => {
                                prop_assert!(skipped > 0);
                            }
                            Err(other) => prop_assert!(false, "unexpected fault {:?}", other),
                        }
                    }
                }
            }
        }

        let stats = reader.stats();
        prop_assert_eq!(
            stats.frames_read + stats.checksum_failures + stats.malformed + stats.frames_dropped,
            reader.read_index()
        );
    }
}

#[test]
fn test_concurrent_reader_sees_valid_increasing_frames() {
    let region = Arc::new(SharedRegion::heap(16).unwrap());
    let mut writer = RingWriter::new(Arc::clone(&region));
    let mut reader = RingReader::new(region);
    let done = Arc::new(AtomicBool::new(false));
    let done_writer = done.clone();

    let producer = std::thread::spawn(move || {
        for sequence in 1..=20_000u64 {
            writer.publish(&vitals(sequence), sequence);
        }
        done_writer.store(true, Ordering::Release);
    });

    let mut last = 0u64;
    let mut received = 0u64;
    loop {
        // Read before polling: once set, every frame is already visible.
        let finished = done.load(Ordering::Acquire);
        match reader.poll() {
            Ok(Some(frame)) => {
                assert!(frame.sequence() > last);
                assert_eq!(frame, vitals(frame.sequence()));
                last = frame.sequence();
                received += 1;
            }
            Ok(None) if finished => break,
            Ok(None) => std::hint::spin_loop(),
            Err(TransportFault::FrameDropped { .. }) => {}
            Err(other) => panic!("torn or corrupt frame surfaced: {:?}", other),
        }
    }
    producer.join().unwrap();

    assert_eq!(last, 20_000);
    assert!(received > 0);
}
