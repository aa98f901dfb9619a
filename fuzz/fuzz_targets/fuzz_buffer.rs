//! Fuzz the code buffer: arbitrary emit/patch sequences must uphold the
//! capacity invariant and bounds-check every retroactive write.

#![no_main]

use libfuzzer_sys::fuzz_target;

use jitasm_rs::CodeBuffer;

fuzz_target!(|data: &[u8]| {
    let mut buf = CodeBuffer::new();
    let mut expected = 0usize;

    let mut chunks = data.chunks_exact(4);
    for op in chunks.by_ref() {
        let value = u64::from(u32::from_le_bytes([op[1], op[2], op[3], 0]));
        match op[0] % 5 {
            0 => {
                buf.emit8(op[1]);
                expected += 1;
            }
            1 => {
                buf.emit16(u16::from_le_bytes([op[1], op[2]]));
                expected += 2;
            }
            2 => {
                buf.emit32(value as u32);
                expected += 4;
            }
            3 => {
                buf.emit64(value);
                expected += 8;
            }
            _ => {
                // Patches past the cursor must error, never corrupt.
                let offset = value as usize % (expected + 8);
                let result = buf.write_at(4, 0x7f, offset);
                assert_eq!(result.is_ok(), offset + 4 <= expected);
            }
        }
        assert_eq!(buf.offset(), expected);
    }

    assert_eq!(buf.to_bytes().len(), expected);
});
