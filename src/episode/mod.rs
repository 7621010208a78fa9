mod download;
mod expand;
mod filename;
mod template;

pub use download::{
    DownloadContext, DownloadedFile, PARTIAL_SUFFIX, TransferLimits, clean_partial_files,
    download_cover, download_episode, restore_staged,
};
pub use expand::{Episode, ExpandContext};
pub use filename::{FilenameCandidate, FilenameStrategy, filename_candidates};
pub use template::{RenameTemplate, VARIABLES};
