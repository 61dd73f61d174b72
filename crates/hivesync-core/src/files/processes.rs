//! Process trees for uploading, downloading and listing file versions.

use super::context::FileContext;
use super::steps::{
    BuildVersion, GetChunks, GetMetaFile, PutChunks, PutMetaFile, PutVersionIndex, ReadLocalFile,
    ResolveVersions, SelectVersion, WriteLocalFile,
};
use crate::model::FileVersion;
use crate::process::{ResultProcess, SequentialProcess};

/// Read the local file, append it as a new version and publish the updated
/// meta file.
pub fn upload_process() -> SequentialProcess<FileContext> {
    SequentialProcess::new("upload-file")
        .with_step(ReadLocalFile)
        .with_step(GetMetaFile::optional())
        .with_step(ResolveVersions)
        .with_step(BuildVersion)
        .with_step(PutChunks::default())
        .with_step(PutVersionIndex::default())
        .with_step(PutMetaFile::default())
}

/// Fetch the latest (or requested) version and overwrite the local file.
pub fn download_process() -> SequentialProcess<FileContext> {
    SequentialProcess::new("download-file")
        .with_step(GetMetaFile::required())
        .with_step(ResolveVersions)
        .with_step(SelectVersion)
        .with_step(GetChunks)
        .with_step(WriteLocalFile::default())
}

/// Deliver the file's version chain, oldest first, to attached listeners.
pub fn file_versions_process() -> ResultProcess<FileContext, Vec<FileVersion>> {
    let inner = SequentialProcess::new("get-file-versions")
        .with_step(GetMetaFile::required())
        .with_step(ResolveVersions);
    ResultProcess::new(inner, |ctx: &mut FileContext| Ok(ctx.versions.clone()))
}

/// Load whatever history the network holds for the file, possibly none.
pub fn inspect_remote_process() -> SequentialProcess<FileContext> {
    SequentialProcess::new("inspect-remote")
        .with_step(GetMetaFile::optional())
        .with_step(ResolveVersions)
}
