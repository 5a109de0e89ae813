//! Bidirectional reconciliation between a virtual cluster and its host
//!
//! For every enabled kind a [`controller::SyncController`] drives a
//! `kube::runtime::Controller` over the virtual kind, with host objects
//! mapped back onto virtual keys. Each reconcile hands the key to the
//! [`engine::SyncEngine`], which reads the pair, classifies it and
//! issues the writes that converge it: host objects follow their virtual
//! counterparts, while status and host-assigned fields flow back.

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod controller;
pub mod descriptor;
pub mod engine;
pub mod hook;
pub mod json;
pub mod patcher;
pub mod runner;
pub mod shared;
pub mod sweeper;
pub mod translator;

pub use cache::{ReadCache, SnapshotStore};
pub use client::{ClusterClient, DeleteOptions, KubeClusterClient, ListFilter};
pub use controller::{KindContext, Requeue, SyncController};
pub use descriptor::{DescriptorRegistry, KindDescriptor};
pub use engine::{SyncEngine, SyncOutcome};
pub use hook::{HookDirection, MutationHook};
pub use patcher::{PatchPlan, Patcher};
pub use runner::{run, run_sync_controllers};
pub use shared::SharedServiceAllocator;
pub use sweeper::{SweepReport, Sweeper};
pub use translator::{EventTranslator, GenericTranslator, KindTranslator, TranslateContext};
