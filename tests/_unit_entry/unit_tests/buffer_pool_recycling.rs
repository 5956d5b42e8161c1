// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use relay_core::buffer::Buffer;

#[test]
fn size_class_buffer_can_hold_its_requested_capacity() {
    let mut b = Buffer::with_size(256);
    assert_eq!(b.cap(), 256);
    assert_eq!(b.len(), 0);

    let n = b.write(&[7u8; 200]).expect("write within capacity");
    assert_eq!(n, 200);
    assert_eq!(b.as_slice(), &[7u8; 200][..]);
}

#[test]
fn write_past_capacity_reports_buffer_full() {
    let mut b = Buffer::with_size(16);
    let err = b.write(&[1u8; 32]).expect_err("should not fit");
    assert_eq!(err.to_string(), "buffer full: tried to write 32 bytes, 16 available");
}

#[test]
fn released_buffer_is_a_no_op_write_sink() {
    let mut b = Buffer::new();
    b.release();
    assert_eq!(b.write(&[1, 2, 3]).expect("release makes write a no-op"), 0);
    assert!(b.is_empty());
}
