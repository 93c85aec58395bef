//! `Reader`/`Processor`/`Writer` adapters binding the crawler and update
//! queue into `pipeline-engine`'s `ChunkEngine`, one module per deployment
//! shape (spec.md §4.1/§4.2/§4.5).

pub mod partitioned;
pub mod region_sweep;
pub mod update_task;
