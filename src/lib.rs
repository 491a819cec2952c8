pub mod cache;

pub mod data_item;

pub mod data_manager;

pub mod entry;

pub mod error;

pub mod failpoint;

pub mod lock_table;

pub mod page;

pub mod page_cache;

pub mod page_file;

pub mod page_index;

pub mod recovery;

pub mod store;

pub mod tm;

pub mod visibility;

pub mod vm;

pub mod wal;

/// Size of every on-disk page, in bytes.
pub const PAGE_SIZE: usize = 1 << 13;

/// 1-based page number within the store file.
pub type Pgno = u32;

/// Transaction identifier. `tm::SUPER_XID` (0) is the reserved
/// always-committed bypass transaction.
pub type Xid = u64;

/// Address of a data item: `(pgno as u64) << 32 | offset as u64`.
pub type Uid = u64;

pub use error::{Error, Result};
pub use store::Store;
pub use vm::IsolationLevel;

/// Packs a page number and in-page offset into an item address.
pub fn uid_from_addr(pgno: Pgno, offset: u16) -> Uid {
    ((pgno as u64) << 32) | offset as u64
}

/// Splits an item address back into its page number and offset.
pub fn addr_from_uid(uid: Uid) -> (Pgno, u16) {
    let offset = (uid & ((1 << 16) - 1)) as u16;
    let pgno = (uid >> 32) as Pgno;
    (pgno, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_round_trips_page_and_offset() {
        let uid = uid_from_addr(42, 517);
        assert_eq!(addr_from_uid(uid), (42, 517));

        let uid = uid_from_addr(u32::MAX, u16::MAX);
        assert_eq!(addr_from_uid(uid), (u32::MAX, u16::MAX));
    }
}
