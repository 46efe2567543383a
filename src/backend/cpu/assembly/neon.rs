//! NEON micro-kernels for aarch64.
//!
//! Each returns the partial result and the number of elements consumed; the
//! caller finishes the tail in scalar code.

use std::arch::aarch64::*;

// ============================================================================
// NEON Kernels (aarch64)
// ============================================================================

#[target_feature(enable = "neon")]
pub unsafe fn dot_u8_neon(a: &[u8], b: &[u8]) -> (i32, usize) {
    let len = a.len().min(b.len());
    let chunks = len / 8;
    let mut acc = vdupq_n_s32(0);

    for i in 0..chunks {
        let offset = i * 8;
        let va = vreinterpretq_s16_u16(vmovl_u8(vld1_u8(a.as_ptr().add(offset))));
        let vb = vreinterpretq_s16_u16(vmovl_u8(vld1_u8(b.as_ptr().add(offset))));
        acc = vmlal_s16(acc, vget_low_s16(va), vget_low_s16(vb));
        acc = vmlal_s16(acc, vget_high_s16(va), vget_high_s16(vb));
    }

    (vaddvq_s32(acc), chunks * 8)
}

#[target_feature(enable = "neon")]
pub unsafe fn dot_s8_neon(a: &[u8], b: &[u8]) -> (i32, usize) {
    let len = a.len().min(b.len());
    let chunks = len / 8;
    let mut acc = vdupq_n_s32(0);

    for i in 0..chunks {
        let offset = i * 8;
        let va = vmovl_s8(vld1_s8(a.as_ptr().add(offset) as *const i8));
        let vb = vmovl_s8(vld1_s8(b.as_ptr().add(offset) as *const i8));
        acc = vmlal_s16(acc, vget_low_s16(va), vget_low_s16(vb));
        acc = vmlal_s16(acc, vget_high_s16(va), vget_high_s16(vb));
    }

    (vaddvq_s32(acc), chunks * 8)
}

/// Lane-wise maximum of two f32 rows into `acc`.
#[target_feature(enable = "neon")]
pub unsafe fn max_f32_neon(acc: &mut [f32], row: &[f32]) -> usize {
    let len = acc.len().min(row.len());
    let chunks = len / 4;
    for i in 0..chunks {
        let offset = i * 4;
        let a = vld1q_f32(acc.as_ptr().add(offset));
        let r = vld1q_f32(row.as_ptr().add(offset));
        vst1q_f32(acc.as_mut_ptr().add(offset), vmaxq_f32(a, r));
    }
    chunks * 4
}

/// Lane-wise sum of two f32 rows into `acc`.
#[target_feature(enable = "neon")]
pub unsafe fn add_f32_neon(acc: &mut [f32], row: &[f32]) -> usize {
    let len = acc.len().min(row.len());
    let chunks = len / 4;
    for i in 0..chunks {
        let offset = i * 4;
        let a = vld1q_f32(acc.as_ptr().add(offset));
        let r = vld1q_f32(row.as_ptr().add(offset));
        vst1q_f32(acc.as_mut_ptr().add(offset), vaddq_f32(a, r));
    }
    chunks * 4
}

/// `acc += a * b` lane-wise, without fusing the multiply and add.
#[target_feature(enable = "neon")]
pub unsafe fn mul_add_f32_neon(acc: &mut [f32], a: &[f32], b: &[f32]) -> usize {
    let len = acc.len().min(a.len()).min(b.len());
    let chunks = len / 4;
    for i in 0..chunks {
        let offset = i * 4;
        let va = vld1q_f32(a.as_ptr().add(offset));
        let vb = vld1q_f32(b.as_ptr().add(offset));
        let vacc = vld1q_f32(acc.as_ptr().add(offset));
        vst1q_f32(acc.as_mut_ptr().add(offset), vaddq_f32(vacc, vmulq_f32(va, vb)));
    }
    chunks * 4
}
