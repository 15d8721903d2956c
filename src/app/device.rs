use lazy_static::lazy_static;
use ort::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};
use tracing::{info, warn};

lazy_static! {
    static ref DEVICE: Device = Device::probe();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Device {
    Cuda,
    CoreMl,
    Cpu,
}

impl Device {
    /// The device picked for this process. Probed once, on first use.
    pub fn current() -> Device {
        *DEVICE
    }

    fn probe() -> Device {
        let cuda = CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false);
        let coreml = CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false);

        let device = Self::pick(cuda, coreml);
        match device {
            Device::Cuda => info!("Using device: cuda (tf32 left to the provider default)"),
            Device::CoreMl => {
                warn!("Using device: coreml. Support is experimental, results may differ from CUDA")
            }
            Device::Cpu => info!("Using device: cpu"),
        }
        device
    }

    /// First available backend in priority order, always ending at the CPU.
    pub fn pick(cuda: bool, coreml: bool) -> Device {
        if cuda {
            Device::Cuda
        } else if coreml {
            Device::CoreMl
        } else {
            Device::Cpu
        }
    }

    pub fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
            Device::CoreMl => vec![CoreMLExecutionProvider::default().build()],
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        assert_eq!(Device::pick(true, true), Device::Cuda);
        assert_eq!(Device::pick(false, true), Device::CoreMl);
        assert_eq!(Device::pick(false, false), Device::Cpu);
    }

    #[test]
    fn display_names() {
        assert_eq!(Device::CoreMl.to_string(), "coreml");
        assert_eq!(Device::Cuda.to_string(), "cuda");
    }
}
