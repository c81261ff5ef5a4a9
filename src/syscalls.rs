//! Syscall name tables, one per [`Abi`].
//!
//! The tables are embedded as `number<TAB>name` lines and parsed once, on first use.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;

use crate::abi::Abi;

const SYSCALLS_X86_64: &str = include_str!("data/syscalls_x86_64.tsv");
const SYSCALLS_I386: &str = include_str!("data/syscalls_i386.tsv");
const SYSCALLS_X32: &str = include_str!("data/syscalls_x32.tsv");
const SYSCALLS_AARCH64: &str = include_str!("data/syscalls_aarch64.tsv");
const SYSCALLS_ARM: &str = include_str!("data/syscalls_arm.tsv");

/// Bidirectional syscall table for one ABI.
#[derive(Debug, Default)]
pub struct Table {
    by_number: BTreeMap<i64, &'static str>,
    by_name: HashMap<&'static str, i64>,
}

impl Table {
    fn parse(data: &'static str) -> Self {
        let mut table = Table::default();

        for line in data.split_terminator('\n') {
            let mut cols = line.split('\t');

            let number = cols.next().and_then(|n| n.trim().parse::<i64>().ok());
            let name = cols.next().map(str::trim);

            if let (Some(number), Some(name)) = (number, name) {
                table.by_number.insert(number, name);
                table.by_name.insert(name, number);
            }
        }

        table
    }

    pub fn number(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, number: i64) -> Option<&'static str> {
        self.by_number.get(&number).copied()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    /// All `(number, name)` entries, in numeric order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &'static str)> + '_ {
        self.by_number.iter().map(|(&number, &name)| (number, name))
    }
}

lazy_static! {
    static ref TABLES: HashMap<Abi, Table> = {
        let mut tables = HashMap::new();
        tables.insert(Abi::X86_64, Table::parse(SYSCALLS_X86_64));
        tables.insert(Abi::I386, Table::parse(SYSCALLS_I386));
        tables.insert(Abi::X32, Table::parse(SYSCALLS_X32));
        tables.insert(Abi::Aarch64, Table::parse(SYSCALLS_AARCH64));
        tables.insert(Abi::Arm, Table::parse(SYSCALLS_ARM));
        tables
    };
}

/// Syscall table of `abi`.
pub fn table(abi: Abi) -> &'static Table {
    &TABLES[&abi]
}

/// Number of the syscall `name` under `abi`.
pub fn lookup_number(name: &str, abi: Abi) -> Option<i64> {
    table(abi).number(name)
}

/// Name of syscall `number` under `abi`.
pub fn lookup_name(number: i64, abi: Abi) -> Option<&'static str> {
    table(abi).name(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_abis() {
        for abi in Abi::ALL {
            let table = table(abi);
            assert!(!table.is_empty(), "empty table for {abi}");

            for (number, name) in table.iter() {
                assert_eq!(lookup_number(lookup_name(number, abi).unwrap(), abi), Some(number));
                assert_eq!(lookup_number(name, abi), Some(number));
            }
        }
    }

    #[test]
    fn test_getpid_numbers() {
        assert_eq!(lookup_number("getpid", Abi::X86_64), Some(39));
        assert_eq!(lookup_number("getpid", Abi::I386), Some(20));
        assert_eq!(lookup_number("getpid", Abi::X32), Some(0x4000_0000 + 39));
        assert_eq!(lookup_number("getpid", Abi::Aarch64), Some(172));
        assert_eq!(lookup_number("getpid", Abi::Arm), Some(20));
    }

    #[test]
    fn test_native_table_matches_libc() {
        let abi = Abi::native();

        assert_eq!(lookup_number("getpid", abi), Some(libc::SYS_getpid as i64));
        assert_eq!(lookup_number("openat", abi), Some(libc::SYS_openat as i64));
        assert_eq!(lookup_name(libc::SYS_execve as i64, abi), Some("execve"));
    }

    #[test]
    fn test_not_found() {
        assert_eq!(lookup_number("no_such_syscall", Abi::X86_64), None);
        assert_eq!(lookup_name(-1, Abi::X86_64), None);

        // Generic table, no legacy `open()`.
        assert_eq!(lookup_number("open", Abi::Aarch64), None);
    }
}
