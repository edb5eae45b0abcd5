use thiserror::Error;

/// Wire-level return codes. Every internal failure maps onto exactly one of
/// these before it reaches a client.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok = 0,
    NoLedger = 1,
    NoEntry = 2,
    Unauthorized = 3,
    LedgerFenced = 4,
    IoError = 5,
    ReadOnly = 6,
    Timeout = 7,
    Shutdown = 8,
}

impl ReturnCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ReturnCode::Ok),
            1 => Some(ReturnCode::NoLedger),
            2 => Some(ReturnCode::NoEntry),
            3 => Some(ReturnCode::Unauthorized),
            4 => Some(ReturnCode::LedgerFenced),
            5 => Some(ReturnCode::IoError),
            6 => Some(ReturnCode::ReadOnly),
            7 => Some(ReturnCode::Timeout),
            8 => Some(ReturnCode::Shutdown),
            _ => None,
        }
    }
}

/// Errors surfaced by bookie operations. The master key is deliberately
/// absent from every variant; key material never reaches a log line.
#[derive(Debug, Error)]
pub enum BookieError {
    #[error("no such ledger {ledger_id}")]
    NoLedger { ledger_id: u64 },
    #[error("no such entry {entry_id} in ledger {ledger_id}")]
    NoEntry { ledger_id: u64, entry_id: u64 },
    #[error("master key mismatch for ledger {ledger_id}")]
    Unauthorized { ledger_id: u64 },
    #[error("ledger {ledger_id} is fenced")]
    LedgerFenced { ledger_id: u64 },
    #[error("bookie is in read-only mode")]
    ReadOnly,
    #[error("request timed out")]
    Timeout,
    #[error("bookie is shutting down")]
    Shutdown,
    #[error("corrupt entry frame for ledger {ledger_id} entry {entry_id}")]
    Corruption { ledger_id: u64, entry_id: u64 },
    #[error("journal I/O error: {0}")]
    Journal(std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BookieError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            BookieError::NoLedger { .. } => ReturnCode::NoLedger,
            BookieError::NoEntry { .. } => ReturnCode::NoEntry,
            BookieError::Unauthorized { .. } => ReturnCode::Unauthorized,
            BookieError::LedgerFenced { .. } => ReturnCode::LedgerFenced,
            BookieError::ReadOnly => ReturnCode::ReadOnly,
            BookieError::Timeout => ReturnCode::Timeout,
            BookieError::Shutdown => ReturnCode::Shutdown,
            BookieError::Corruption { .. }
            | BookieError::Journal(_)
            | BookieError::Io(_) => ReturnCode::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_round_trip() {
        for code in [
            ReturnCode::Ok,
            ReturnCode::NoLedger,
            ReturnCode::NoEntry,
            ReturnCode::Unauthorized,
            ReturnCode::LedgerFenced,
            ReturnCode::IoError,
            ReturnCode::ReadOnly,
            ReturnCode::Timeout,
            ReturnCode::Shutdown,
        ] {
            assert_eq!(ReturnCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(ReturnCode::from_u32(99), None);
    }

    #[test]
    fn corruption_maps_to_io_error() {
        let err = BookieError::Corruption {
            ledger_id: 1,
            entry_id: 2,
        };
        assert_eq!(err.return_code(), ReturnCode::IoError);
    }
}
