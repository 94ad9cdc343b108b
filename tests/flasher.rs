//! End-to-end scenarios driven against an in-memory fake serial link —
//! no real hardware involved. Mirrors the wire bytes a real ROM
//! bootloader and stub would produce closely enough to exercise the
//! whole connect -> sync -> stub-load -> write -> reboot pipeline.

use std::io::{Cursor, Write as _};

use esp8266_flasher::connection::fake::FakeLink;
use esp8266_flasher::flasher::{FlashFrequency, FlashMode, FlashSize, State};
use esp8266_flasher::rom::{OP_MEM_BEGIN, OP_MEM_DATA, OP_MEM_END, OP_READ_REG, OP_SYNC};
use esp8266_flasher::slip::encode;
use esp8266_flasher::{Bundle, Error, Flasher, NoProgress, ProgressCallbacks, Segment, StubDescriptor};

const OP_FLASH_WRITE: u8 = 1;

fn rom_reply(op: u8, val: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x01, op];
    frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
    frame.extend_from_slice(&val.to_le_bytes());
    frame.extend_from_slice(data);
    encode(&frame)
}

fn rom_ok(op: u8) -> Vec<u8> {
    rom_reply(op, 0, &[0x00, 0x00])
}

fn stub_descriptor() -> StubDescriptor {
    StubDescriptor::from_json(
        r#"{"code":"0011","code_start":0,"data":"","data_start":0,"num_params":1,"params_start":0,"entry":4}"#,
    )
    .unwrap()
}

/// Connects, syncs, loads a trivial stub and confirms OHAI. Returns the
/// flasher plus the link handle so a test can queue more replies and
/// inspect what was written.
fn synced_and_stub_loaded(stub_baud: u32) -> (Flasher<FakeLink>, FakeLink) {
    let link = FakeLink::new();

    link.push_incoming(&[0x11, 0x22, 0x33]); // garbage before the first delimiter
    link.push_incoming(&encode(&[0x00, 0x01])); // a too-short reply, silently skipped
    link.push_incoming(&rom_ok(OP_SYNC));

    let mut flasher = Flasher::new(link.clone());
    flasher.connect().unwrap();
    assert_eq!(flasher.state(), State::Synced);

    link.push_incoming(&rom_ok(OP_MEM_BEGIN));
    link.push_incoming(&rom_ok(OP_MEM_DATA));
    link.push_incoming(&rom_ok(OP_MEM_END));
    link.push_incoming(&encode(b"OHAI, I am the stub"));

    flasher.load_stub(&stub_descriptor(), stub_baud).unwrap();
    assert_eq!(flasher.state(), State::StubReady);

    (flasher, link)
}

#[test]
fn sync_success_then_chip_id() {
    let link = FakeLink::new();
    link.push_incoming(&[0x11, 0x22, 0x33]);
    link.push_incoming(&encode(&[0x00, 0x01]));
    link.push_incoming(&rom_ok(OP_SYNC));

    let mut flasher = Flasher::new(link.clone());
    flasher.connect().unwrap();
    assert_eq!(flasher.state(), State::Synced);

    link.push_incoming(&rom_reply(OP_READ_REG, 0x1234_5678, &[]));
    link.push_incoming(&rom_reply(OP_READ_REG, 0x9ABC_DEF0, &[]));

    let id = flasher.chip_id().unwrap();
    assert_eq!(
        id,
        (0x1234_5678u32 >> 24) | ((0x9ABC_DEF0u32 & 0x00FF_FFFF) << 8)
    );
}

#[test]
fn stub_upload_and_ohai_raises_baud() {
    let (flasher, link) = synced_and_stub_loaded(921_600);
    assert_eq!(flasher.state(), State::StubReady);
    assert_eq!(link.baud_history(), vec![921_600]);
}

#[test]
fn write_one_segment_progress_is_monotonic() {
    let (mut flasher, link) = synced_and_stub_loaded(0);

    let data = vec![0xA5u8; 0x2000];
    let mut segment = Segment::new(0x10000, data.clone());

    // counter frames the stub would push back as it writes the data.
    for counter in [0u32, 2048, 4096, 6144, 8192] {
        link.push_incoming(&encode(&counter.to_le_bytes()));
    }
    let digest = md5::compute(&data).0;
    link.push_incoming(&encode(&digest));
    link.push_incoming(&encode(&[0x00]));

    struct Recorder(Vec<usize>);
    impl ProgressCallbacks for Recorder {
        fn init(&mut self, _addr: u32, _total: usize) {}
        fn update(&mut self, current: usize) {
            self.0.push(current);
        }
        fn finish(&mut self) {}
    }
    let mut recorder = Recorder(Vec::new());

    flasher
        .write_segments(
            std::slice::from_mut(&mut segment),
            FlashMode::Dio,
            FlashSize::Flash4M,
            FlashFrequency::Freq40M,
            &mut recorder,
        )
        .unwrap();

    assert!(recorder.0.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(recorder.0.last(), Some(&0x2000));

    let written = link.written();
    let mut frames = Vec::new();
    let mut decoder = esp8266_flasher::slip::SlipDecoder::new();
    decoder.feed(&written, &mut frames).unwrap();
    assert_eq!(frames[0], vec![OP_FLASH_WRITE]);
    let mut expected_args = Vec::new();
    expected_args.extend_from_slice(&0x10000u32.to_le_bytes());
    expected_args.extend_from_slice(&0x2000u32.to_le_bytes());
    expected_args.extend_from_slice(&1u32.to_le_bytes());
    assert_eq!(frames[1], expected_args);
}

#[test]
fn md5_mismatch_fails_the_write_and_skips_reboot() {
    let (mut flasher, link) = synced_and_stub_loaded(0);

    let data = vec![0xA5u8; 0x1000];
    let mut segment = Segment::new(0x10000, data);

    for counter in [0u32, 2048, 4096] {
        link.push_incoming(&encode(&counter.to_le_bytes()));
    }
    link.push_incoming(&encode(&[0xDE; 16])); // corrupted digest
    link.push_incoming(&encode(&[0x00]));

    let err = flasher
        .write_segments(
            std::slice::from_mut(&mut segment),
            FlashMode::Dio,
            FlashSize::Flash4M,
            FlashFrequency::Freq40M,
            &mut NoProgress,
        )
        .unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }));

    // no BOOT_FW frame was ever written after the bad digest.
    let mut frames = Vec::new();
    esp8266_flasher::slip::SlipDecoder::new()
        .feed(&link.written(), &mut frames)
        .unwrap();
    assert!(!frames.iter().any(|f| f.as_slice() == [6u8]));
}

#[test]
fn write_segments_patches_and_pads_without_caller_help() {
    // A boot image straight out of `Bundle::load` (or built by hand):
    // unpadded, header untouched. `write_segments` must patch and pad
    // it itself, not rely on the caller having already done so.
    let (mut flasher, link) = synced_and_stub_loaded(0);

    let mut segment = Segment::new(0, vec![0xE9, 0x00, 0x00, 0x00, 0xAB]);

    for counter in [0u32, 2048, 4096] {
        link.push_incoming(&encode(&counter.to_le_bytes()));
    }
    let padded_len = 0x1000usize;
    // Reconstruct what the padded+patched payload will look like to
    // compute the digest the fake stub should hand back.
    let mut expected_payload = vec![
        0xE9,
        0x00,
        FlashMode::Dio as u8,
        FlashSize::Flash4M as u8 | FlashFrequency::Freq40M as u8,
        0xAB,
    ];
    expected_payload.resize(padded_len, 0xFF);
    let digest = md5::compute(&expected_payload).0;
    link.push_incoming(&encode(&digest));
    link.push_incoming(&encode(&[0x00]));

    flasher
        .write_segments(
            std::slice::from_mut(&mut segment),
            FlashMode::Dio,
            FlashSize::Flash4M,
            FlashFrequency::Freq40M,
            &mut NoProgress,
        )
        .unwrap();

    assert_eq!(segment.payload.len(), padded_len);
    assert_eq!(segment.payload[2], FlashMode::Dio as u8);
    assert_eq!(
        segment.payload[3],
        FlashSize::Flash4M as u8 | FlashFrequency::Freq40M as u8
    );
    assert!(segment.payload[5..].iter().all(|&b| b == 0xFF));
}

#[test]
fn reboot_success_and_failure() {
    let (mut flasher, link) = synced_and_stub_loaded(0);
    link.push_incoming(&encode(&[0x00]));
    flasher.reboot().unwrap();
    assert_eq!(flasher.state(), State::Done);

    let (mut flasher, link) = synced_and_stub_loaded(0);
    link.push_incoming(&encode(&[0x01]));
    let err = flasher.reboot().unwrap_err();
    assert!(matches!(err, Error::WriteFailure(1)));
}

#[test]
fn bundle_manifest_orders_segments_and_filters_firmware() {
    let mut zip_bytes = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(Cursor::new(&mut zip_bytes));
        let opts = zip::write::FileOptions::default();

        writer.start_file("manifest.txt", opts).unwrap();
        writer
            .write_all(
                b"# 1.2.3\n00000000:boot.bin\n00001000:user1.bin\n00081000:user2.bin\n",
            )
            .unwrap();

        writer.start_file("boot.bin", opts).unwrap();
        writer.write_all(&[0xE9, 0, 0, 0]).unwrap();

        writer.start_file("user1.bin", opts).unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();

        writer.start_file("user2.bin", opts).unwrap();
        writer.write_all(&[4, 5, 6]).unwrap();

        writer.finish().unwrap();
    }

    let bundle = Bundle::load(Cursor::new(zip_bytes.clone()), false).unwrap();
    assert_eq!(bundle.version.as_deref(), Some("1.2.3"));
    assert_eq!(
        bundle.segments.iter().map(|s| s.address).collect::<Vec<_>>(),
        vec![0x00000000, 0x00001000, 0x00081000]
    );

    let firmware_only = Bundle::load(Cursor::new(zip_bytes), true).unwrap();
    assert_eq!(firmware_only.segments.len(), 2);
    assert!(firmware_only.segments.iter().all(|s| s.address >= 0x1000));
}
