use crate::{config::CheckerConfig, core::checkers::errors::QuotaError};

/// Checkers currently held by one owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckerQuotas {
    pub bytes_per_user: u64,
    pub amount_per_user: u64,
    pub code_file_size: u64,
}

impl CheckerQuotas {
    pub fn check_new(&self, size: u64, usage: Usage) -> Result<(), QuotaError> {
        self.check_size(size)?;
        if usage.count + 1 > self.amount_per_user {
            return Err(QuotaError::TooManyCheckers {
                count: usage.count,
                limit: self.amount_per_user,
            });
        }
        self.check_storage(usage.bytes + size)
    }

    /// The replaced source no longer counts against the owner.
    pub fn check_replacement(
        &self,
        new_size: u64,
        old_size: u64,
        usage: Usage,
    ) -> Result<(), QuotaError> {
        self.check_size(new_size)?;
        self.check_storage(usage.bytes.saturating_sub(old_size) + new_size)
    }

    fn check_size(&self, size: u64) -> Result<(), QuotaError> {
        if size > self.code_file_size {
            return Err(QuotaError::SourceTooLarge {
                size,
                limit: self.code_file_size,
            });
        }
        Ok(())
    }

    fn check_storage(&self, used: u64) -> Result<(), QuotaError> {
        if used > self.bytes_per_user {
            return Err(QuotaError::StorageExceeded {
                used,
                limit: self.bytes_per_user,
            });
        }
        Ok(())
    }
}

impl From<&CheckerConfig> for CheckerQuotas {
    fn from(config: &CheckerConfig) -> Self {
        Self {
            bytes_per_user: config.bytes_per_user_limit,
            amount_per_user: config.amount_per_user_limit,
            code_file_size: config.code_file_size_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTAS: CheckerQuotas = CheckerQuotas {
        bytes_per_user: 1000,
        amount_per_user: 2,
        code_file_size: 400,
    };

    #[test]
    fn test_new_checker_within_quota() {
        assert_eq!(QUOTAS.check_new(400, Usage { count: 1, bytes: 600 }), Ok(()));
    }

    #[test]
    fn test_new_checker_rejections() {
        assert_eq!(
            QUOTAS.check_new(401, Usage::default()),
            Err(QuotaError::SourceTooLarge { size: 401, limit: 400 })
        );
        assert_eq!(
            QUOTAS.check_new(10, Usage { count: 2, bytes: 20 }),
            Err(QuotaError::TooManyCheckers { count: 2, limit: 2 })
        );
        assert_eq!(
            QUOTAS.check_new(300, Usage { count: 1, bytes: 800 }),
            Err(QuotaError::StorageExceeded { used: 1100, limit: 1000 })
        );
    }

    #[test]
    fn test_replacement_discounts_old_source() {
        let usage = Usage { count: 2, bytes: 1000 };
        assert_eq!(QUOTAS.check_replacement(350, 400, usage), Ok(()));
        assert_eq!(
            QUOTAS.check_replacement(400, 300, usage),
            Err(QuotaError::StorageExceeded { used: 1100, limit: 1000 })
        );
    }
}
