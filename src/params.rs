// SPDX-License-Identifier: MIT

//! Device-parameter records and their 128-byte kernel framing.
//!
//! Grounded on `ublk::control::{DeviceParams, DeviceAttr, DevParamBasic,
//! DevParamDiscard}`, extended with the `devt`/`zoned` sub-records and the
//! trailing reservation the kernel's 128-byte `ublk_params` buffer requires
//! (the teacher's version was 60 bytes, covering only `basic`/`discard`).

use bitflags::bitflags;
use std::mem;

bitflags! {
    /// Device attribute flags (`ublk_param_basic::attrs`).
    #[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceAttr: u32 {
        /// Read-only device.
        const ReadOnly = sys::DevParamBasic::ATTR_READ_ONLY;
        /// Rotational device.
        const Rotational = sys::DevParamBasic::ATTR_ROTATIONAL;
        /// A device with a volatile cache.
        const VolatileCache = sys::DevParamBasic::ATTR_VOLATILE_CACHE;
        /// FUA (force-unit-access) support.
        const Fua = sys::DevParamBasic::ATTR_FUA;
    }
}

/// Device parameters, as exposed to callers of [`crate::control::Controller`].
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    /// Device attributes.
    pub attrs: DeviceAttr,
    /// `log2` of the logical block size.
    pub logical_bs_shift: u8,
    /// `log2` of the physical block size.
    pub physical_bs_shift: u8,
    /// `log2` of the optimal I/O size (0 if none).
    pub io_opt_shift: u8,
    /// `log2` of the minimum I/O size.
    pub io_min_shift: u8,
    /// Maximum sectors per request.
    pub max_sectors: u32,
    /// Chunk-sector size (0 if the device has no chunk boundary).
    pub chunk_sectors: u32,
    /// Device size, in 512-byte sectors.
    pub dev_sectors: u64,
    /// Virtual-boundary mask (0 if none).
    pub virt_boundary_mask: u64,
    /// Optional discard parameters.
    pub discard: Option<DeviceParamDiscard>,
    /// Optional backing character/disk device numbers.
    pub devt: Option<DeviceParamDevt>,
    /// Optional zoned-device parameters.
    pub zoned: Option<DeviceParamZoned>,
}

/// Optional discard parameters (`ublk_param_discard`).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceParamDiscard {
    /// Discard alignment, in bytes.
    pub discard_alignment: u32,
    /// Discard granularity, in bytes.
    pub discard_granularity: u32,
    /// Maximum sectors per discard request.
    pub max_discard_sectors: u32,
    /// Maximum sectors per write-zeroes request.
    pub max_write_zeroes_sectors: u32,
    /// Maximum number of discard segments per request.
    pub max_discard_segments: u16,
}

/// Backing device numbers (`ublk_param_devt`), read back via `GET_PARAMS`.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceParamDevt {
    /// Character device major number.
    pub char_major: u32,
    /// Character device minor number.
    pub char_minor: u32,
    /// Block device major number.
    pub disk_major: u32,
    /// Block device minor number.
    pub disk_minor: u32,
}

/// Optional zoned-device parameters (`ublk_param_zoned`). The core does not
/// implement the zoned-block I/O path (see Non-goals); this record exists so
/// `GET_PARAMS` round-trips the kernel's reply without loss.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceParamZoned {
    /// Maximum number of open zones (0 means unlimited).
    pub max_open_zones: u32,
    /// Maximum number of active zones (0 means unlimited).
    pub max_active_zones: u32,
    /// Maximum sectors per zone-append command.
    pub max_zone_append_sectors: u32,
}

impl DeviceParams {
    /// Builds the "basic" parameter record for an ordinary (non-zoned,
    /// non-discard) device of `dev_size_bytes` bytes with
    /// `logical_block_size`-byte logical blocks.
    ///
    /// Sets the logical/physical/minimum-I/O shifts to `log2(logical_block_size)`,
    /// leaves the optimal-I/O shift at zero, sets a maximum request size of
    /// 1024 sectors (512 KiB), and computes `dev_sectors` as
    /// `dev_size_bytes / logical_block_size`. Only the `basic` sub-record is
    /// populated; `discard`/`devt`/`zoned` are left unset.
    #[must_use]
    pub fn basic(dev_size_bytes: u64, logical_block_size: u32) -> Self {
        /// 1024 sectors = 512 KiB, a reasonable default max request size.
        const DEFAULT_MAX_SECTORS: u32 = 1024;

        let shift = logical_block_size.trailing_zeros() as u8;
        Self {
            attrs: DeviceAttr::empty(),
            logical_bs_shift: shift,
            physical_bs_shift: shift,
            io_opt_shift: 0,
            io_min_shift: shift,
            max_sectors: DEFAULT_MAX_SECTORS,
            chunk_sectors: 0,
            dev_sectors: dev_size_bytes / u64::from(logical_block_size),
            virt_boundary_mask: 0,
            discard: None,
            devt: None,
            zoned: None,
        }
    }
}

/// Kernel wire layout for the parameter buffer (module-private).
pub(crate) mod sys {
    use super::{DeviceAttr, DeviceParamDevt, DeviceParamDiscard, DeviceParamZoned, DeviceParams};
    use std::mem;

    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    pub struct DevParamBasic {
        pub attrs: u32,
        pub logical_bs_shift: u8,
        pub physical_bs_shift: u8,
        pub io_opt_shift: u8,
        pub io_min_shift: u8,
        pub max_sectors: u32,
        pub chunk_sectors: u32,
        pub dev_sectors: u64,
        pub virt_boundary_mask: u64,
    }

    impl DevParamBasic {
        pub const ATTR_READ_ONLY: u32 = 1 << 0;
        pub const ATTR_ROTATIONAL: u32 = 1 << 1;
        pub const ATTR_VOLATILE_CACHE: u32 = 1 << 2;
        pub const ATTR_FUA: u32 = 1 << 3;
    }

    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    pub struct DevParamDiscard {
        pub discard_alignment: u32,
        pub discard_granularity: u32,
        pub max_discard_sectors: u32,
        pub max_write_zeroes_sectors: u32,
        pub max_discard_segments: u16,
        _reserved0: u16,
    }

    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    pub struct DevParamDevt {
        pub char_major: u32,
        pub char_minor: u32,
        pub disk_major: u32,
        pub disk_minor: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone)]
    pub struct DevParamZoned {
        pub max_open_zones: u32,
        pub max_active_zones: u32,
        pub max_zone_append_sectors: u32,
        _reserved: [u8; 20],
    }

    /// Total framed size the kernel requires for `SET_PARAMS`/`GET_PARAMS`.
    pub const FRAMED_SIZE: usize = 128;

    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct DevParams {
        len: u32,
        types: u32,
        pub basic: DevParamBasic,
        pub discard: DevParamDiscard,
        pub devt: DevParamDevt,
        pub zoned: DevParamZoned,
        _reserved: [u8; Self::PAD_BYTES],
    }

    impl DevParams {
        const TYPE_BASIC: u32 = 1 << 0;
        const TYPE_DISCARD: u32 = 1 << 1;
        const TYPE_DEVT: u32 = 1 << 2;
        const TYPE_ZONED: u32 = 1 << 3;

        const PAD_BYTES: usize = FRAMED_SIZE
            - mem::size_of::<u32>() * 2
            - mem::size_of::<DevParamBasic>()
            - mem::size_of::<DevParamDiscard>()
            - mem::size_of::<DevParamDevt>()
            - mem::size_of::<DevParamZoned>();

        /// Only used for `GET_PARAMS`: the kernel ignores `types` on that
        /// command and returns every sub-record it has regardless.
        pub fn empty() -> Self {
            Self {
                len: FRAMED_SIZE as u32,
                types: 0,
                basic: DevParamBasic::default(),
                discard: DevParamDiscard::default(),
                devt: DevParamDevt::default(),
                zoned: DevParamZoned::default(),
                _reserved: [0; Self::PAD_BYTES],
            }
        }
    }

    const _: () = assert!(mem::size_of::<DevParamBasic>() == 32, "invalid size");
    const _: () = assert!(mem::size_of::<DevParamDiscard>() == 20, "invalid size");
    const _: () = assert!(mem::size_of::<DevParamDevt>() == 16, "invalid size");
    const _: () = assert!(mem::size_of::<DevParamZoned>() == 32, "invalid size");
    const _: () = assert!(mem::size_of::<DevParams>() == FRAMED_SIZE, "invalid size");

    impl From<DevParams> for DeviceParams {
        fn from(p: DevParams) -> Self {
            let discard = ((p.types & DevParams::TYPE_DISCARD) != 0).then_some(DeviceParamDiscard {
                discard_alignment: p.discard.discard_alignment,
                discard_granularity: p.discard.discard_granularity,
                max_discard_sectors: p.discard.max_discard_sectors,
                max_write_zeroes_sectors: p.discard.max_write_zeroes_sectors,
                max_discard_segments: p.discard.max_discard_segments,
            });

            let devt = ((p.types & DevParams::TYPE_DEVT) != 0).then_some(DeviceParamDevt {
                char_major: p.devt.char_major,
                char_minor: p.devt.char_minor,
                disk_major: p.devt.disk_major,
                disk_minor: p.devt.disk_minor,
            });

            let zoned = ((p.types & DevParams::TYPE_ZONED) != 0).then_some(DeviceParamZoned {
                max_open_zones: p.zoned.max_open_zones,
                max_active_zones: p.zoned.max_active_zones,
                max_zone_append_sectors: p.zoned.max_zone_append_sectors,
            });

            Self {
                attrs: DeviceAttr::from_bits_truncate(p.basic.attrs),
                logical_bs_shift: p.basic.logical_bs_shift,
                physical_bs_shift: p.basic.physical_bs_shift,
                io_opt_shift: p.basic.io_opt_shift,
                io_min_shift: p.basic.io_min_shift,
                max_sectors: p.basic.max_sectors,
                chunk_sectors: p.basic.chunk_sectors,
                dev_sectors: p.basic.dev_sectors,
                virt_boundary_mask: p.basic.virt_boundary_mask,
                discard,
                devt,
                zoned,
            }
        }
    }

    impl From<&DeviceParams> for DevParams {
        fn from(d: &DeviceParams) -> Self {
            let mut p = Self::empty();
            p.types = Self::TYPE_BASIC;

            p.basic.attrs = d.attrs.bits();
            p.basic.logical_bs_shift = d.logical_bs_shift;
            p.basic.physical_bs_shift = d.physical_bs_shift;
            p.basic.io_opt_shift = d.io_opt_shift;
            p.basic.io_min_shift = d.io_min_shift;
            p.basic.max_sectors = d.max_sectors;
            p.basic.chunk_sectors = d.chunk_sectors;
            p.basic.dev_sectors = d.dev_sectors;
            p.basic.virt_boundary_mask = d.virt_boundary_mask;

            if let Some(discard) = d.discard {
                p.types |= Self::TYPE_DISCARD;
                p.discard = DevParamDiscard {
                    discard_alignment: discard.discard_alignment,
                    discard_granularity: discard.discard_granularity,
                    max_discard_sectors: discard.max_discard_sectors,
                    max_write_zeroes_sectors: discard.max_write_zeroes_sectors,
                    max_discard_segments: discard.max_discard_segments,
                    _reserved0: 0,
                };
            }

            if let Some(devt) = d.devt {
                p.types |= Self::TYPE_DEVT;
                p.devt = DevParamDevt {
                    char_major: devt.char_major,
                    char_minor: devt.char_minor,
                    disk_major: devt.disk_major,
                    disk_minor: devt.disk_minor,
                };
            }

            if let Some(zoned) = d.zoned {
                p.types |= Self::TYPE_ZONED;
                p.zoned = DevParamZoned {
                    max_open_zones: zoned.max_open_zones,
                    max_active_zones: zoned.max_active_zones,
                    max_zone_append_sectors: zoned.max_zone_append_sectors,
                    _reserved: [0; 20],
                };
            }

            p
        }
    }
}

const _: () = assert!(mem::size_of::<sys::DevParams>() == sys::FRAMED_SIZE, "invalid size");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_helper_matches_reference_values() {
        let p = DeviceParams::basic(1024 * 1024 * 1024, 512);
        assert_eq!(p.logical_bs_shift, 9);
        assert_eq!(p.physical_bs_shift, 9);
        assert_eq!(p.io_min_shift, 9);
        assert_eq!(p.io_opt_shift, 0);
        assert_eq!(p.dev_sectors, 2_097_152);
        assert_eq!(p.max_sectors, 1024);
        assert!(p.discard.is_none());
    }

    #[test]
    fn framed_buffer_is_128_bytes() {
        assert_eq!(mem::size_of::<sys::DevParams>(), 128);
    }

    #[test]
    fn round_trip_through_wire_layout_preserves_basic_fields() {
        let params = DeviceParams {
            discard: Some(DeviceParamDiscard {
                discard_alignment: 4096,
                discard_granularity: 4096,
                max_discard_sectors: 8192,
                max_write_zeroes_sectors: 8192,
                max_discard_segments: 1,
            }),
            ..DeviceParams::basic(64 * 1024 * 1024, 512)
        };

        let wire: sys::DevParams = (&params).into();
        let back: DeviceParams = wire.into();

        assert_eq!(back.dev_sectors, params.dev_sectors);
        assert_eq!(back.logical_bs_shift, params.logical_bs_shift);
        assert_eq!(back.discard, params.discard);
        assert!(back.devt.is_none());
        assert!(back.zoned.is_none());
    }
}
