// vm_traps/src/cpu/mod.rs

//! # CPU Feature Probe
//!
//! Identification, feature flags and cache geometry of the host AArch64 CPU.
//! The probe runs once per process; afterwards every query is a plain read of
//! an immutable, write-once value and may be issued from any thread.

mod probe;

pub use self::probe::{parse_cpuinfo, CpuIdentity};

use bitflags::bitflags;
use core::fmt;
use spin::Once;

/// CPU implementers, keyed by the MIDR implementer byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Family {
    Arm = b'A',
    Broadcom = b'B',
    Cavium = b'C',
    Dec = b'D',
    Infineon = b'I',
    Motorola = b'M',
    Nvidia = b'N',
    Amcc = b'P',
    Qualcomm = b'Q',
    Marvell = b'V',
    Apple = b'a',
    Intel = b'i',
}

impl Family {
    pub fn from_implementer(implementer: u8) -> Option<Self> {
        match implementer {
            b'A' => Some(Family::Arm),
            b'B' => Some(Family::Broadcom),
            b'C' => Some(Family::Cavium),
            b'D' => Some(Family::Dec),
            b'I' => Some(Family::Infineon),
            b'M' => Some(Family::Motorola),
            b'N' => Some(Family::Nvidia),
            b'P' => Some(Family::Amcc),
            b'Q' => Some(Family::Qualcomm),
            b'V' => Some(Family::Marvell),
            b'a' => Some(Family::Apple),
            b'i' => Some(Family::Intel),
            _ => None,
        }
    }
}

bitflags! {
    /// Feature bits. The low bits follow the kernel's `AT_HWCAP` layout; the
    /// top bits are quirks derived from the CPU identity.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CpuFeatures: u32 {
        const FP = 1 << 0;
        const ASIMD = 1 << 1;
        const EVTSTRM = 1 << 2;
        const AES = 1 << 3;
        const PMULL = 1 << 4;
        const SHA1 = 1 << 5;
        const SHA2 = 1 << 6;
        const CRC32 = 1 << 7;
        const LSE = 1 << 8;
        const STXR_PREFETCH = 1 << 29;
        const A53MAC = 1 << 30;
        const DMB_ATOMICS = 1 << 31;
    }
}

/// Part numbers the quirk table cares about.
const CORTEX_A53: u32 = 0xd03;
const CORTEX_A57: u32 = 0xd07;
const THUNDERX: u32 = 0x0a1;

/// Raw cache-type and zero-fill identification registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PsrInfo {
    pub dczid_el0: u32,
    pub ctr_el0: u32,
}

impl PsrInfo {
    /// Register values describing 64-byte cache lines and no usable
    /// zero-fill instruction.
    pub const CONSERVATIVE: PsrInfo = PsrInfo {
        dczid_el0: 0x10,
        ctr_el0: 4 | (4 << 16),
    };

    /// `DC ZVA` is usable when DZP (bit 4) is clear and the block size
    /// field is non-zero.
    pub fn is_zva_enabled(&self) -> bool {
        (self.dczid_el0 & 0x10) == 0 && (self.dczid_el0 & 0xf) != 0
    }

    pub fn zva_length(&self) -> usize {
        4 << (self.dczid_el0 & 0xf)
    }

    pub fn icache_line_size(&self) -> usize {
        (1 << (self.ctr_el0 & 0x0f)) * 4
    }

    pub fn dcache_line_size(&self) -> usize {
        (1 << ((self.ctr_el0 >> 16) & 0x0f)) * 4
    }
}

/// Everything the code generator needs to know about the CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CpuFeatureSet {
    pub implementer: u8,
    pub model: u32,
    pub model2: u32,
    pub variant: u32,
    pub revision: u32,
    pub stepping: u32,
    pub features: CpuFeatures,
    pub psr: PsrInfo,
    pub icache_line_size: usize,
    pub dcache_line_size: usize,
    pub zero_fill_enabled: bool,
    pub zero_fill_length: usize,
}

impl CpuFeatureSet {
    /// Combines the probed identity, hwcap bits and identification registers.
    pub fn from_parts(identity: CpuIdentity, hwcap: CpuFeatures, psr: PsrInfo) -> Self {
        let mut features = hwcap & !(CpuFeatures::STXR_PREFETCH | CpuFeatures::A53MAC | CpuFeatures::DMB_ATOMICS);
        let family = Family::from_implementer(identity.implementer);
        let has_part = |part| identity.model == part || identity.model2 == part;

        if family == Some(Family::Cavium) && identity.model == THUNDERX && identity.variant == 0 {
            features |= CpuFeatures::DMB_ATOMICS;
        }
        if family == Some(Family::Arm) && has_part(CORTEX_A53) {
            features |= CpuFeatures::A53MAC;
        }
        if family == Some(Family::Arm) && has_part(CORTEX_A57) {
            features |= CpuFeatures::STXR_PREFETCH;
        }

        let zero_fill_enabled = psr.is_zva_enabled();
        Self {
            implementer: identity.implementer,
            model: identity.model,
            model2: identity.model2,
            variant: identity.variant,
            revision: identity.revision,
            stepping: identity.architecture,
            features,
            psr,
            icache_line_size: psr.icache_line_size(),
            dcache_line_size: psr.dcache_line_size(),
            zero_fill_enabled,
            zero_fill_length: if zero_fill_enabled { psr.zva_length() } else { 0 },
        }
    }

    pub fn family(&self) -> Option<Family> {
        Family::from_implementer(self.implementer)
    }

    pub fn has(&self, feature: CpuFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Whether a load of `load_size` bytes with an index scaled by `scale`
    /// costs an extra cycle on this CPU.
    pub fn expensive_load(&self, load_size: usize, scale: usize) -> bool {
        // ldrsh w0, [x1, w2, sxtw #1] on ARM-designed cores.
        self.family() == Some(Family::Arm) && load_size == 2 && scale == 2
    }
}

impl fmt::Display for CpuFeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02x}:0x{:x}:0x{:03x}:{}",
            self.implementer, self.variant, self.model, self.revision
        )?;
        if self.model2 != 0 {
            write!(f, "(0x{:03x})", self.model2)?;
        }
        const NAMES: [(CpuFeatures, &str); 12] = [
            (CpuFeatures::FP, "fp"),
            (CpuFeatures::ASIMD, "simd"),
            (CpuFeatures::EVTSTRM, "evtstrm"),
            (CpuFeatures::AES, "aes"),
            (CpuFeatures::PMULL, "pmull"),
            (CpuFeatures::SHA1, "sha1"),
            (CpuFeatures::SHA2, "sha256"),
            (CpuFeatures::CRC32, "crc"),
            (CpuFeatures::LSE, "lse"),
            (CpuFeatures::STXR_PREFETCH, "stxr_prefetch"),
            (CpuFeatures::A53MAC, "a53mac"),
            (CpuFeatures::DMB_ATOMICS, "dmb_atomics"),
        ];
        for (flag, name) in NAMES {
            if self.features.contains(flag) {
                write!(f, ", {}", name)?;
            }
        }
        Ok(())
    }
}

static FEATURES: Once<CpuFeatureSet> = Once::new();

/// Probes the CPU. Only the first call does any work; later calls, from any
/// thread, return the same value.
pub fn initialize() -> &'static CpuFeatureSet {
    FEATURES.call_once(probe::probe)
}

/// Whether [`initialize`] has completed.
pub fn is_initialized() -> bool {
    FEATURES.is_completed()
}

/// The process-wide feature set, probing first if nobody has yet.
pub fn features() -> &'static CpuFeatureSet {
    initialize()
}

pub fn cpu_family() -> u8 {
    features().implementer
}

pub fn cpu_model() -> u32 {
    features().model
}

pub fn cpu_model2() -> u32 {
    features().model2
}

pub fn cpu_variant() -> u32 {
    features().variant
}

pub fn cpu_revision() -> u32 {
    features().revision
}

pub fn icache_line_size() -> usize {
    features().icache_line_size
}

pub fn dcache_line_size() -> usize {
    features().dcache_line_size
}

pub fn is_zero_fill_enabled() -> bool {
    features().zero_fill_enabled
}

/// Bytes cleared by one zero-fill instruction, or `None` when the
/// instruction is unavailable.
pub fn zero_fill_length() -> Option<usize> {
    let set = features();
    set.zero_fill_enabled.then_some(set.zero_fill_length)
}

pub fn expensive_load(load_size: usize, scale: usize) -> bool {
    features().expensive_load(load_size, scale)
}
