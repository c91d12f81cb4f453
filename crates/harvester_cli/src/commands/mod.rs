pub(crate) mod collect;
pub(crate) mod jobs;
pub(crate) mod migrate;
