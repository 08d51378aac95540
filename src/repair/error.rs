use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("can not fix quota with id {0}")]
    InvalidQuotaID(i64),
    #[error("failed to fix quota, label DiskQuota not set")]
    MissingDiskQuotaLabel,
    #[error("only support fix container quota with origin quota, got {0}")]
    NotOriginQuota(i64),
    #[error("failed to fix quota with ambiguous DiskQuota {0:?}")]
    AmbiguousDiskQuota(BTreeMap<String, String>),
    #[error("failed to fix container quota, can not get quota id from config: {0:?}")]
    MissingConfigQuotaID(String),
    #[error("failed to fix container quota, can not get quota limit")]
    MissingLimit,
    #[error("failed to fix container rootfs quota, upper directory unknown")]
    MissingUpperDir,
    #[error(
        "failed to fix container rootfs quota id, quota id get from label({label}) and \
         directory({on_disk}) not equal, please specify the quota id explicitly"
    )]
    QuotaIDMismatch { label: u32, on_disk: u32 },
    #[error("failed to fix {target} quota id, can not get it from the request, label or directory")]
    UnresolvedQuotaID { target: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
