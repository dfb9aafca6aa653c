//! Conversion between cpal sample buffers and little-endian PCM bytes

use bytes::{BufMut, Bytes, BytesMut};

/// Encode 16-bit samples
pub fn i16_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        out.put_i16_le(*sample);
    }
    out.freeze()
}

/// Encode 8-bit samples
pub fn i8_to_bytes(samples: &[i8]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len());
    for sample in samples {
        out.put_i8(*sample);
    }
    out.freeze()
}

/// Encode float samples as 16-bit PCM, for devices that only run in f32
pub fn f32_to_i16_bytes(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        out.put_i16_le((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
    }
    out.freeze()
}

/// Encode float samples as 8-bit PCM
pub fn f32_to_i8_bytes(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len());
    for sample in samples {
        out.put_i8((sample.clamp(-1.0, 1.0) * i8::MAX as f32) as i8);
    }
    out.freeze()
}

/// Fill `out` from a byte queue, zeroing whatever the queue cannot cover.
/// Returns the number of bytes consumed.
pub fn fill_i16(out: &mut [i16], pending: &mut BytesMut) -> usize {
    let mut consumed = 0;
    for sample in out.iter_mut() {
        if pending.len() >= 2 {
            let chunk = pending.split_to(2);
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            consumed += 2;
        } else {
            *sample = 0;
        }
    }
    consumed
}

/// 8-bit counterpart of [`fill_i16`]
pub fn fill_i8(out: &mut [i8], pending: &mut BytesMut) -> usize {
    let mut consumed = 0;
    for sample in out.iter_mut() {
        if !pending.is_empty() {
            let chunk = pending.split_to(1);
            *sample = chunk[0] as i8;
            consumed += 1;
        } else {
            *sample = 0;
        }
    }
    consumed
}

/// Fill float samples from 16-bit PCM bytes
pub fn fill_f32_from_i16(out: &mut [f32], pending: &mut BytesMut) -> usize {
    let mut consumed = 0;
    for sample in out.iter_mut() {
        if pending.len() >= 2 {
            let chunk = pending.split_to(2);
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
            consumed += 2;
        } else {
            *sample = 0.0;
        }
    }
    consumed
}

/// Fill float samples from 8-bit PCM bytes
pub fn fill_f32_from_i8(out: &mut [f32], pending: &mut BytesMut) -> usize {
    let mut consumed = 0;
    for sample in out.iter_mut() {
        if !pending.is_empty() {
            let chunk = pending.split_to(1);
            *sample = (chunk[0] as i8) as f32 / i8::MAX as f32;
            consumed += 1;
        } else {
            *sample = 0.0;
        }
    }
    consumed
}
