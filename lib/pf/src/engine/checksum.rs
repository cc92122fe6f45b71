// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types for calculating the internet checksum.
//!
//! The [`Checksum`] type provides a rolling one's complement sum,
//! allowing a sum to be built up (or incrementally updated) before it
//! is finalized into the value stored in a header.
//!
//! # Checksums and Endianness
//!
//! Header fields in [`super::packet`] are held as logical host
//! integers that were read from the wire in network order. All of the
//! arithmetic here therefore works on big-endian 16-bit words: byte
//! slices are folded with `u16::from_be_bytes()`, and a finalized sum
//! is the logical value of the checksum field. The one's complement
//! sum is byte-order independent (RFC 1071 §1.B), so this agrees with
//! a sum taken over native words and then byte swapped.
//!
//! # Incremental updates
//!
//! When a translated header field changes from `m` to `m'` the stored
//! checksum `HC` is updated without touching the rest of the packet,
//! using equation 3 of RFC 1624:
//!
//! ```text
//! HC' = ~(~HC + ~m + m')
//! ```
//!
//! # Relevant RFCs
//!
//! * 1071 Computing the Internet Checksum
//!
//! * 1141 Incremental Updating of the Internet Checksum
//!
//! * 1624 Computation of the Internet Checksum via Incremental Update

use pf_api::Af;
use pf_api::PfAddr;

/// A rolling one's complement checksum calculation.
///
/// Carries are accumulated in the upper half of the `u32` and only
/// folded back in by [`Checksum::finalize`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    /// Creates a new checksum counter.
    pub fn new() -> Self {
        Self { inner: 0 }
    }

    /// Start a rolling checksum from the value found in a header.
    pub fn from_header(hc: u16) -> Self {
        Self { inner: u32::from(!hc) }
    }

    /// Create a new rolling checksum, starting with the passed in
    /// `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::new();
        csum.add_bytes(bytes);
        csum
    }

    /// Update the sum by adding the contents of `bytes`. An odd
    /// trailing byte is padded with zero.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.add_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    /// Update the sum by subtracting the contents of `bytes`.
    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.sub_u16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.sub_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    pub fn add_u16(&mut self, word: u16) {
        self.inner += u32::from(word);
        self.fold_carries();
    }

    pub fn sub_u16(&mut self, word: u16) {
        self.inner += u32::from(!word);
        self.fold_carries();
    }

    pub fn add_u32(&mut self, val: u32) {
        self.add_u16((val >> 16) as u16);
        self.add_u16(val as u16);
    }

    pub fn sub_u32(&mut self, val: u32) {
        self.sub_u16((val >> 16) as u16);
        self.sub_u16(val as u16);
    }

    pub fn add_addr(&mut self, af: Af, addr: PfAddr) {
        addr.csum_words(af).for_each(|w| self.add_u16(w));
    }

    pub fn sub_addr(&mut self, af: Af, addr: PfAddr) {
        addr.csum_words(af).for_each(|w| self.sub_u16(w));
    }

    /// Finalize the sum by adding up all the accumulated carries and
    /// returning the resulting value as a `u16`.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }

    /// Finalize and take the one's complement: the value stored in
    /// the header's checksum field.
    pub fn header_value(mut self) -> u16 {
        !self.finalize()
    }

    // Keep the accumulator from ever overflowing on long updates.
    fn fold_carries(&mut self) {
        if self.inner >= 0xFFFF_0000 {
            self.finalize();
        }
    }
}

/// How a checksum field treats a computed value of zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZeroPolicy {
    /// TCP, ICMP and IP header checksums: zero is a valid value.
    Normal,
    /// UDP: a zero field means "no checksum" and is left alone; a
    /// computed zero is transmitted as all ones.
    Udp,
}

/// An incremental checksum update for a single header checksum.
#[derive(Clone, Copy, Debug)]
pub struct Fixup {
    csum: Checksum,
    policy: ZeroPolicy,
    disabled: bool,
}

impl Fixup {
    pub fn new(hc: u16, policy: ZeroPolicy) -> Self {
        Self {
            csum: Checksum::from_header(hc),
            policy,
            disabled: policy == ZeroPolicy::Udp && hc == 0,
        }
    }

    pub fn u16(&mut self, old: u16, new: u16) -> &mut Self {
        self.csum.sub_u16(old);
        self.csum.add_u16(new);
        self
    }

    pub fn u32(&mut self, old: u32, new: u32) -> &mut Self {
        self.csum.sub_u32(old);
        self.csum.add_u32(new);
        self
    }

    pub fn addr(&mut self, af: Af, old: PfAddr, new: PfAddr) -> &mut Self {
        self.csum.sub_addr(af, old);
        self.csum.add_addr(af, new);
        self
    }

    /// A run of bytes changing from `old` to `new`. Both runs must
    /// start on the same 16-bit alignment.
    pub fn bytes(&mut self, old: &[u8], new: &[u8]) -> &mut Self {
        self.csum.sub_bytes(old);
        self.csum.add_bytes(new);
        self
    }

    /// Produce the new header value.
    pub fn finish(&self, original: u16) -> u16 {
        if self.disabled {
            return original;
        }
        let val = self.csum.header_value();
        match self.policy {
            ZeroPolicy::Udp if val == 0 => 0xFFFF,
            _ => val,
        }
    }
}

/// Update `hc` for a 16-bit field changing from `old` to `new`.
pub fn fixup_u16(hc: u16, old: u16, new: u16, policy: ZeroPolicy) -> u16 {
    Fixup::new(hc, policy).u16(old, new).finish(hc)
}

/// Update `hc` for a 32-bit field changing from `old` to `new`.
pub fn fixup_u32(hc: u16, old: u32, new: u32, policy: ZeroPolicy) -> u16 {
    Fixup::new(hc, policy).u32(old, new).finish(hc)
}

/// Update `hc` for an address changing from `old` to `new`.
pub fn fixup_addr(
    hc: u16,
    af: Af,
    old: PfAddr,
    new: PfAddr,
    policy: ZeroPolicy,
) -> u16 {
    Fixup::new(hc, policy).addr(af, old, new).finish(hc)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    // The example header from RFC 1071 §3.
    const RFC1071: [u8; 8] = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];

    #[test]
    fn rfc1071_example() {
        let mut c = Checksum::compute(&RFC1071);
        assert_eq!(c.finalize(), 0xddf2);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        let mut a = Checksum::compute(&[0x12, 0x34, 0x56]);
        let mut b = Checksum::compute(&[0x12, 0x34, 0x56, 0x00]);
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn incremental_matches_recompute() {
        let mut data = RFC1071;
        let hc = Checksum::compute(&data).header_value();

        let old = u16::from_be_bytes([data[2], data[3]]);
        let new: u16 = 0x1234;
        data[2..4].copy_from_slice(&new.to_be_bytes());

        let fixed = fixup_u16(hc, old, new, ZeroPolicy::Normal);
        assert_eq!(fixed, Checksum::compute(&data).header_value());
    }

    #[test]
    fn address_fixup_matches_recompute() {
        let a = PfAddr::from(Ipv4Addr::new(10, 0, 0, 5));
        let b = PfAddr::from(Ipv4Addr::new(192, 0, 2, 1));
        let mut data = vec![0u8; 12];
        data[4..8].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 5).octets());
        data[8..12].copy_from_slice(&[0xab, 0xcd, 0x00, 0x50]);
        let hc = Checksum::compute(&data).header_value();

        data[4..8].copy_from_slice(&Ipv4Addr::new(192, 0, 2, 1).octets());
        let fixed = fixup_addr(hc, Af::Inet, a, b, ZeroPolicy::Normal);
        assert_eq!(fixed, Checksum::compute(&data).header_value());
    }

    #[test]
    fn byte_run_fixup_matches_recompute() {
        let mut data = RFC1071.to_vec();
        data.extend_from_slice(&[0x45, 0x00, 0x00, 0x1c]);
        let hc = Checksum::compute(&data).header_value();

        let old = data[8..12].to_vec();
        data[8..12].copy_from_slice(&[0x46, 0x10, 0x00, 0x20]);
        let fixed = Fixup::new(hc, ZeroPolicy::Normal)
            .bytes(&old, &data[8..12])
            .finish(hc);
        assert_eq!(fixed, Checksum::compute(&data).header_value());
    }

    #[test]
    fn udp_zero_checksum_untouched() {
        assert_eq!(fixup_u16(0, 1000, 2000, ZeroPolicy::Udp), 0);
    }

    #[test]
    fn udp_computed_zero_becomes_ones() {
        // Pick a header value that a change from 1 to 0 will turn
        // into zero: ~(~hc + ~1 + 0) == 0 requires ~hc + ~1 == 0xffff,
        // i.e. ~hc == 1.
        let hc = !1u16;
        assert_eq!(fixup_u16(hc, 1, 0, ZeroPolicy::Normal), 0);
        assert_eq!(fixup_u16(hc, 1, 0, ZeroPolicy::Udp), 0xFFFF);
    }
}
