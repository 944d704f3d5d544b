// SPDX-License-Identifier: MIT

//! Fixed-layout kernel ABI pieces shared by the control and queue paths:
//! the ioctl-number encoder, the control/I/O command enums, and the block-op
//! decode for a descriptor's packed op+flags word.

/// `_IOC` direction bits: every ublk command is read-write.
const IOCTL_DIR_READ_WRITE: u32 = 3;

/// `_IOC` type byte: `'u'`.
const IOCTL_TYPE: u32 = 0x75;

/// Size, in bytes, of the cmd area used by control commands (`CmdData`).
pub const CTRL_CMD_SIZE: u32 = 32;

/// Size, in bytes, of the cmd area used by I/O commands (`IoCmd`).
pub const IO_CMD_SIZE: u32 = 16;

/// Encodes a ublk command number the way kernels `>= 6.11` require when a
/// device is created with the `IOCTL_ENCODE` feature bit set:
/// `(dir << 30) | (size << 16) | ('u' << 8) | nr`.
#[must_use]
pub const fn ioctl_encode(size: u32, nr: u32) -> u32 {
    (IOCTL_DIR_READ_WRITE << 30) | (size << 16) | (IOCTL_TYPE << 8) | nr
}

/// Control command opcodes handled by the ublk kernel driver.
///
/// `StartUserRecovery`, `EndUserRecovery`, and `GetDevInfo2` are kept as named
/// constants for a complete, forward-compatible enum even though user-recovery
/// is not implemented by this crate (see the Non-goals in the crate's design
/// notes): no [`crate::control::Controller`] method issues them.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtrlOp {
    /// `UBLK_CMD_GET_QUEUE_AFFINITY`
    GetQueueAffinity = 1,
    /// `UBLK_CMD_GET_DEV_INFO`
    GetDevInfo = 2,
    /// `UBLK_CMD_ADD_DEV`
    AddDev = 4,
    /// `UBLK_CMD_DEL_DEV`
    DelDev = 5,
    /// `UBLK_CMD_START_DEV`
    StartDev = 6,
    /// `UBLK_CMD_STOP_DEV`
    StopDev = 7,
    /// `UBLK_CMD_SET_PARAMS`
    SetParams = 8,
    /// `UBLK_CMD_GET_PARAMS`
    GetParams = 9,
    /// `UBLK_CMD_START_USER_RECOVERY` — reserved, not implemented.
    StartUserRecovery = 16,
    /// `UBLK_CMD_END_USER_RECOVERY` — reserved, not implemented.
    EndUserRecovery = 17,
    /// `UBLK_CMD_GET_DEV_INFO2` — reserved, not implemented.
    GetDevInfo2 = 18,
}

impl CtrlOp {
    /// The ioctl-encoded command number for this control op.
    #[must_use]
    pub const fn encoded(self) -> u32 {
        ioctl_encode(CTRL_CMD_SIZE, self as u32)
    }
}

/// I/O command opcodes submitted on a queue's ring.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoOp {
    /// `UBLK_IO_FETCH_REQ` — arm a tag for the next request.
    FetchReq = 32,
    /// `UBLK_IO_COMMIT_AND_FETCH_REQ` — report a result and re-arm the tag.
    CommitAndFetchReq = 33,
    /// `UBLK_IO_NEED_GET_DATA` — reserved, not implemented (zero-copy path).
    NeedGetData = 34,
}

impl IoOp {
    /// The ioctl-encoded command number for this I/O op.
    #[must_use]
    pub const fn encoded(self) -> u32 {
        ioctl_encode(IO_CMD_SIZE, self as u32)
    }
}

/// Block-level operation carried by an I/O descriptor's packed op+flags word.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockOp {
    /// Read.
    Read = 0,
    /// Write.
    Write = 1,
    /// Flush (cache sync), no data transfer.
    Flush = 2,
    /// Discard a sector range.
    Discard = 3,
    /// Write the same pattern across a sector range.
    WriteSame = 4,
    /// Write zeroes across a sector range.
    WriteZeroes = 5,
    /// Securely erase a sector range.
    SecureErase = 6,
    /// Open a sequential-write-required zone.
    ZoneOpen = 10,
    /// Close an open zone.
    ZoneClose = 11,
    /// Finish (fill) a zone.
    ZoneFinish = 12,
    /// Append to a sequential zone; the kernel assigns the write pointer.
    ZoneAppend = 13,
    /// Reset every zone on the device.
    ZoneResetAll = 14,
    /// Reset one zone's write pointer.
    ZoneReset = 15,
    /// Report zone state.
    ReportZones = 18,
}

impl BlockOp {
    /// Decodes a raw op byte, returning `None` for an op code outside the
    /// known set so callers can distinguish "unsupported" from "malformed".
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Flush),
            3 => Some(Self::Discard),
            4 => Some(Self::WriteSame),
            5 => Some(Self::WriteZeroes),
            6 => Some(Self::SecureErase),
            10 => Some(Self::ZoneOpen),
            11 => Some(Self::ZoneClose),
            12 => Some(Self::ZoneFinish),
            13 => Some(Self::ZoneAppend),
            14 => Some(Self::ZoneResetAll),
            15 => Some(Self::ZoneReset),
            18 => Some(Self::ReportZones),
            _ => None,
        }
    }
}

/// A decoded descriptor op+flags word: `op` is the low 8 bits (`None` if the
/// op code is outside the known [`BlockOp`] set), `flags` the upper 24 bits.
#[derive(Debug, Copy, Clone)]
pub struct DecodedOp {
    /// The known block operation, or `None` if `raw_op` is unrecognised.
    pub op: Option<BlockOp>,
    /// The raw, undecoded op byte (useful for diagnostics on unknown ops).
    pub raw_op: u8,
    /// The flags carried in the upper 24 bits of the word.
    pub flags: u32,
}

/// Decodes a packed op+flags `u32`: op in the low 8 bits, flags in the next 24.
#[must_use]
pub const fn decode_op_flags(word: u32) -> DecodedOp {
    let raw_op = (word & 0xFF) as u8;
    let flags = (word >> 8) & 0x00FF_FFFF;
    DecodedOp {
        op: BlockOp::from_raw(raw_op),
        raw_op,
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_encoding_matches_reference_values() {
        assert_eq!(CtrlOp::AddDev.encoded(), 0xc020_7504);
        assert_eq!(CtrlOp::DelDev.encoded(), 0xc020_7505);
        assert_eq!(CtrlOp::StartDev.encoded(), 0xc020_7506);
        assert_eq!(CtrlOp::SetParams.encoded(), 0xc020_7508);
        assert_eq!(IoOp::FetchReq.encoded(), 0xc010_7520);
        assert_eq!(IoOp::CommitAndFetchReq.encoded(), 0xc010_7521);
    }

    #[test]
    fn ioctl_encoding_formula_holds_for_every_command() {
        for (op, nr) in [
            (CtrlOp::GetQueueAffinity, 1),
            (CtrlOp::GetDevInfo, 2),
            (CtrlOp::AddDev, 4),
            (CtrlOp::DelDev, 5),
            (CtrlOp::StartDev, 6),
            (CtrlOp::StopDev, 7),
            (CtrlOp::SetParams, 8),
            (CtrlOp::GetParams, 9),
        ] {
            let expected = (3u32 << 30) | (32u32 << 16) | (0x75u32 << 8) | nr;
            assert_eq!(op.encoded(), expected);
        }

        for (op, nr) in [
            (IoOp::FetchReq, 32),
            (IoOp::CommitAndFetchReq, 33),
            (IoOp::NeedGetData, 34),
        ] {
            let expected = (3u32 << 30) | (16u32 << 16) | (0x75u32 << 8) | nr;
            assert_eq!(op.encoded(), expected);
        }
    }

    #[test]
    fn descriptor_decode_splits_op_and_flags() {
        let word = 0x00AB_CD03u32; // op=3 (Discard), flags=0xABCD
        let decoded = decode_op_flags(word);
        assert_eq!(decoded.raw_op, 3);
        assert_eq!(decoded.op, Some(BlockOp::Discard));
        assert_eq!(decoded.flags, 0x00AB_CD);
    }

    #[test]
    fn descriptor_decode_reports_unknown_ops_distinctly() {
        let decoded = decode_op_flags(0xFF);
        assert_eq!(decoded.raw_op, 0xFF);
        assert!(decoded.op.is_none());
    }

    #[test]
    fn descriptor_decode_masks_flags_to_24_bits() {
        let decoded = decode_op_flags(0xFFFF_FF00);
        assert_eq!(decoded.flags, 0x00FF_FFFF);
        assert_eq!(decoded.raw_op, 0);
    }
}
