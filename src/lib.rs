#![forbid(unsafe_code)]
//! Generator composition with an edit-preserving output writer.
//!
//! Generators are described as [`GeneratorBundle`]s: trees of tasks that
//! exchange typed values through providers. The bundle is instantiated into
//! a [`GeneratorTree`], every dependency is resolved to the single task that
//! provides it, and the [`Executor`] runs the tasks phase by phase to build
//! a [`GeneratorOutput`]. Finally [`sync`] reconciles that output with the
//! target directory, three-way merging it with whatever was edited by hand
//! since the previous run.
//!
//! ```rust
//! use kumiki::{
//!     FileData, GeneratorBundle, NoopFormatter, ProviderType, SyncOptions, TaskDescriptor,
//!     TaskOutput,
//! };
//!
//! let name: ProviderType<String> = ProviderType::new("name");
//! let model_name = name.clone();
//!
//! let bundle = GeneratorBundle::new("app")
//!     .task(
//!         TaskDescriptor::define("name")
//!             .exports(name.export())
//!             .run(move |_| Ok(TaskOutput::new().export(&name, "user".to_string()))),
//!     )
//!     .child(
//!         "model",
//!         GeneratorBundle::new("model").base_directory("models").task(
//!             TaskDescriptor::define("file")
//!                 .depends_on(model_name.dependency())
//!                 .run(move |ctx| {
//!                     let name = ctx.get(&model_name)?.clone();
//!                     Ok(TaskOutput::new().build(move |ctx| {
//!                         ctx.add_file(format!("{name}.ts"), FileData::text("export {};\n"))?;
//!                         Ok(())
//!                     }))
//!                 }),
//!         ),
//!     );
//!
//! let dir = tempfile::tempdir()?;
//! let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
//! let options = SyncOptions::new(&root);
//!
//! let report = kumiki::sync(&bundle, [], &options, &NoopFormatter)?;
//! assert_eq!(report.written.len(), 1);
//! assert!(root.join("models/user.ts").exists());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod bundle;
mod config;
mod core;
mod engine;
mod error;
mod output;
mod provider;
pub mod snapshot;
pub mod state;
pub mod sync;
mod tree;
mod utils;

pub use crate::bundle::{Child, GeneratorBundle, TaskDef, TaskDescriptor};
pub use crate::config::{CONCURRENCY_ENV, SyncOptions};
pub use crate::engine::{
    BuildContext, BuildStep, Executor, Phase, Schedule, TaskContext, TaskOutput, sort_phases,
};
pub use crate::error::*;
pub use crate::output::{FileContents, FileData, GeneratorOutput, TemplateInfo, WriteOptions};
pub use crate::provider::{Dependency, Export, ProviderType, Scope, Visibility};
pub use crate::snapshot::{
    SnapshotManifest, apply_snapshot_to_generator_output, save_snapshot_diff_file,
};
pub use crate::sync::{
    CommandFormatter, Formatter, NoopFormatter, OutputWriter, SyncReport, WritePlan, sync,
};
pub use crate::tree::{GeneratorEntry, GeneratorTree, ResolvedDependency, TaskEntry};
pub use crate::utils::init_logging;
