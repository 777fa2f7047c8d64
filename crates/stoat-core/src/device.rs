// Device — Compute device identity and thread binding
//
// The engine partitions backward work by device: one ready queue and one
// worker thread per device, with queue 0 reserved for the CPU. The tensor
// library owns the actual runtimes; this module only names devices, maps
// them to queue indices, and tracks which device the current thread is
// bound to.

use std::cell::Cell;
use std::sync::OnceLock;

/// Identifies a compute device (e.g., "cpu", "accel:0", "accel:1").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    /// A numbered accelerator (GPU or similar), indexed from zero.
    Accelerator(usize),
}

impl Device {
    /// A human-readable name for this device.
    pub fn name(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Accelerator(id) => format!("accel:{id}"),
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Index of the ready queue serving this device (CPU is queue 0).
    pub fn queue_index(&self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Accelerator(id) => id + 1,
        }
    }

    /// Inverse of [`Device::queue_index`].
    pub fn from_queue_index(index: usize) -> Device {
        if index == 0 {
            Device::Cpu
        } else {
            Device::Accelerator(index - 1)
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

// Accelerator discovery
//
// The embedding tensor library registers how many accelerators exist before
// the global engine is first used. The count is read exactly once when the
// engine starts its threads; registering later has no effect on an engine
// that already started.

static ACCELERATOR_COUNT: OnceLock<usize> = OnceLock::new();

/// Register the number of accelerator devices available in this process.
/// Returns false if the count was already fixed (first registration wins).
pub fn set_accelerator_count(count: usize) -> bool {
    ACCELERATOR_COUNT.set(count).is_ok()
}

/// Number of registered accelerator devices (0 until registered).
pub fn accelerator_count() -> usize {
    *ACCELERATOR_COUNT.get_or_init(|| 0)
}

// Thread binding

thread_local! {
    static CURRENT_DEVICE: Cell<Device> = const { Cell::new(Device::Cpu) };
}

/// The device the current thread is bound to.
pub fn current_device() -> Device {
    CURRENT_DEVICE.with(|d| d.get())
}

/// Permanently bind the current thread to `device`. Worker threads call this
/// once at startup so in-thread tensor ops land on the right device.
pub fn bind_thread(device: Device) {
    CURRENT_DEVICE.with(|d| d.set(device));
}

/// RAII guard that switches the current thread's device and restores the
/// previous binding on drop. The engine wraps cross-device tensor work
/// (gradient accumulation, cloning) in one of these.
pub struct DeviceGuard {
    previous: Device,
}

impl DeviceGuard {
    pub fn new(device: Device) -> DeviceGuard {
        let previous = current_device();
        CURRENT_DEVICE.with(|d| d.set(device));
        DeviceGuard { previous }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|d| d.set(self.previous));
    }
}
