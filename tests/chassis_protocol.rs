//! Chassis fixture wire-format contract.
//!
//! Pins the frame layout (sync, big-endian length/type, CRC16-Kermit
//! trailer), the request/response pairing, and the status-code vocabulary.

use webpdtool::instruments::chassis_link::{
    crc16_kermit, decode_frame, encode_frame, ChassisFrame, ChassisMessageType, ChassisStatus,
    RESPONSE_BIT, SYNC,
};

#[test]
fn crc16_kermit_reference_vectors() {
    assert_eq!(crc16_kermit(b"123456789"), 0x2189);
    assert_eq!(crc16_kermit(b""), 0x0000);
    assert_eq!(crc16_kermit(b"A"), crc16_kermit(b"A"));
    assert_ne!(crc16_kermit(b"A"), crc16_kermit(b"B"));
}

#[test]
fn frame_layout_is_sync_len_type_body_crc_big_endian() {
    let frame = ChassisFrame::request(ChassisMessageType::GetAngle, vec![]);
    let wire = encode_frame(&frame);

    assert_eq!(&wire[..4], &SYNC);
    assert_eq!(&SYNC, &[0xA5, 0xFF, 0x00, 0xCC]);
    // length covers msg_type + body = 2 bytes here
    assert_eq!(&wire[4..6], &[0x00, 0x02]);
    // msg_type big-endian
    assert_eq!(&wire[6..8], &[0x00, 0x02]);
    // CRC over the msg_type+body span
    let crc = crc16_kermit(&wire[6..8]);
    assert_eq!(&wire[8..10], &crc.to_be_bytes());
    assert_eq!(wire.len(), 10);
}

#[test]
fn rotate_request_carries_signed_centidegrees() {
    // +90.00 degrees = 9000 centidegrees = 0x00002328
    let frame = ChassisFrame::request(
        ChassisMessageType::RotateTurntable,
        9000i32.to_be_bytes().to_vec(),
    );
    let wire = encode_frame(&frame);
    assert_eq!(&wire[4..6], &[0x00, 0x06]); // 2 (type) + 4 (angle)
    assert_eq!(&wire[8..12], &[0x00, 0x00, 0x23, 0x28]);

    let decoded = decode_frame(&wire).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn every_message_type_round_trips() {
    for msg_type in [
        ChassisMessageType::RotateTurntable,
        ChassisMessageType::GetAngle,
        ChassisMessageType::WaitForTurntable,
        ChassisMessageType::ActuateCliffDoor,
        ChassisMessageType::ReadEncoderCount,
    ] {
        let frame = ChassisFrame::request(msg_type, vec![1, 2, 3]);
        let decoded = decode_frame(&encode_frame(&frame)).unwrap();
        assert_eq!(decoded, frame);
        assert!(!decoded.is_response());

        let response = ChassisFrame::response(msg_type, vec![0]);
        assert!(response.is_response());
        assert_eq!(response.msg_type & !RESPONSE_BIT, msg_type as u16);
        assert_eq!(ChassisMessageType::from_wire(response.msg_type), Some(msg_type));
    }
}

#[test]
fn status_codes_match_the_fixture_vocabulary() {
    assert_eq!(ChassisStatus::from_wire(0), Some(ChassisStatus::Success));
    assert_eq!(ChassisStatus::from_wire(1), Some(ChassisStatus::GeneralFailure));
    assert_eq!(ChassisStatus::from_wire(2), Some(ChassisStatus::Timeout));
    assert_eq!(ChassisStatus::from_wire(3), None);

    let response = ChassisFrame::response(ChassisMessageType::GetAngle, vec![2]);
    assert_eq!(response.status().unwrap(), ChassisStatus::Timeout);
}

#[test]
fn corrupt_frames_are_rejected() {
    let frame = ChassisFrame::request(ChassisMessageType::GetAngle, vec![]);
    let good = encode_frame(&frame);

    // Truncated
    assert!(decode_frame(&good[..good.len() - 1]).is_err());
    // Bad sync
    let mut bad_sync = good.clone();
    bad_sync[1] = 0x00;
    assert!(decode_frame(&bad_sync).is_err());
    // Flipped body/crc bit
    let mut bad_crc = good.clone();
    bad_crc[7] ^= 0x01;
    assert!(decode_frame(&bad_crc).is_err());
}
