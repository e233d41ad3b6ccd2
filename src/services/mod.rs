pub mod completion;
pub mod image_host;
pub mod ingress;
pub mod job_store;
pub mod normalizer;
pub mod provider;
pub mod staging;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testing;
