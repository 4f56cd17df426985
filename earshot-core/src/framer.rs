//! Overlap-add patch framing.
//!
//! Each processing cycle hands the feature extractor one patch of
//! `patch_len` samples whose first `overlap` samples are bit-identical to the
//! last `overlap` samples of the previous patch. The framer keeps the patch
//! in a single buffer reused every cycle: it copies the trailing overlap
//! forward, then consumes exactly `patch_len - overlap` fresh samples from
//! the capture ring into the tail.
//!
//! This copy-forward + consume pair is the correctness core of the whole
//! pipeline — combined with the ring's FIFO guarantee it means no sample is
//! ever skipped or repeated across cycle boundaries.

use crate::ring::SampleRing;

pub struct PatchFramer {
    patch: Box<[i16]>,
    overlap: usize,
}

impl PatchFramer {
    /// Create a framer for patches of `patch_len` samples with `overlap`
    /// samples carried between consecutive patches. The initial patch is
    /// silence, so the first cycle's overlapped head is zeros.
    pub fn new(patch_len: usize, overlap: usize) -> Self {
        debug_assert!(overlap < patch_len);
        Self {
            patch: vec![0i16; patch_len].into_boxed_slice(),
            overlap,
        }
    }

    /// Fresh samples consumed from the ring per patch.
    pub fn no_overlap_len(&self) -> usize {
        self.patch.len() - self.overlap
    }

    /// Assemble the next patch. Returns `None` without touching any state
    /// when the ring does not yet hold a full cycle's worth of samples.
    pub fn next_patch(&mut self, ring: &SampleRing) -> Option<&[i16]> {
        let fresh = self.no_overlap_len();
        if ring.available() < fresh {
            return None;
        }
        let len = self.patch.len();
        self.patch.copy_within(len - self.overlap.., 0);
        let consumed = ring.consume(&mut self.patch[self.overlap..]);
        // Single consumer: availability cannot shrink between the check and
        // the consume.
        debug_assert!(consumed);
        if !consumed {
            return None;
        }
        Some(&self.patch)
    }

    /// The current patch (most recently framed).
    pub fn patch(&self) -> &[i16] {
        &self.patch
    }

    /// The non-overlapped tail of the current patch — the samples that first
    /// appeared this cycle. Used as the raw playback source when processing
    /// output is disabled.
    pub fn fresh_tail(&self) -> &[i16] {
        &self.patch[self.overlap..]
    }
}
