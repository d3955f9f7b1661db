// gpu/mod.rs — wgpu compute backend.
//
// `GpuBackend` implements the crate's `ComputeBackend` on a Vulkan adapter.
// The CPU `HostBackend` stays the authoritative reference: every kernel
// here is checked against it on the same inputs.
//
// Layering:
//
//   device.rs   adapter selection, limits profiles, workgroup sizing
//   texture.rs  R32Float upload through aligned staging, readback
//   backend.rs  buffers, error scopes, kernel pipelines and dispatch
//
// Kernel sources live in src/shaders/ and are specialised with the
// device's workgroup size when the pipeline is built.

pub mod backend;
pub mod device;
pub mod texture;

pub use backend::{GpuBackend, GpuBuffer};
pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
pub use texture::GpuTexture;

/// Run one `#[ignore]`d inner GPU test in a child `cargo test` and require
/// its GPU_TEST_OK marker. dzn on WSL2 can segfault at process exit after a
/// Vulkan device was opened, so the child's exit status is not trusted.
#[cfg(test)]
pub(crate) fn run_isolated(test_name: &str) {
    let output = std::process::Command::new("cargo")
        .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
    let out = String::from_utf8_lossy(&output.stdout).into_owned() + &String::from_utf8_lossy(&output.stderr);
    print!("{out}");
    assert!(out.contains("GPU_TEST_OK"), "{test_name} did not print GPU_TEST_OK:\n{out}");
}
