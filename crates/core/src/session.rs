//! Inference sessions and their per-backend lifecycle.
//!
//! A [`SessionManager`] lives inside the execution context and holds at most
//! one session per model key, all compiled for the same backend. Selecting a
//! different backend drops every session; they are recompiled lazily.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::error::PipelineError;
use crate::model_registry::ModelDescriptor;
use crate::types::PlanarTensor;

/// A compiled model that maps a planar `[0, 1]` tensor to a planar `[0, 1]`
/// tensor of `scale` times the spatial size.
pub trait InferenceSession: Send {
    fn run(&mut self, input: &PlanarTensor) -> Result<PlanarTensor>;
}

pub trait SessionFactory: Send + Sync {
    fn compile(
        &self,
        model: &ModelDescriptor,
        bytes: &[u8],
        backend: InferenceBackend,
    ) -> Result<Box<dyn InferenceSession>>;
}

pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    active_backend: Option<InferenceBackend>,
    sessions: HashMap<String, Box<dyn InferenceSession>>,
    compile_count: usize,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            active_backend: None,
            sessions: HashMap::new(),
            compile_count: 0,
        }
    }

    pub fn active_backend(&self) -> Option<InferenceBackend> {
        self.active_backend
    }

    /// Switch to `backend`, dropping all sessions if it differs from the
    /// current one. Returns whether sessions were invalidated.
    pub fn select_backend(&mut self, backend: InferenceBackend) -> bool {
        if self.active_backend == Some(backend) {
            return false;
        }
        let dropped = self.sessions.len();
        self.sessions.clear();
        if let Some(previous) = self.active_backend.replace(backend) {
            info!(from = %previous, to = %backend, dropped, "Backend changed, sessions invalidated");
        }
        true
    }

    /// Session for `model` under `backend`, compiling it from `bytes` if
    /// there is none yet.
    pub fn ensure(
        &mut self,
        model: &ModelDescriptor,
        bytes: &[u8],
        backend: InferenceBackend,
    ) -> Result<&mut dyn InferenceSession, PipelineError> {
        self.select_backend(backend);

        let session = match self.sessions.entry(model.key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(model = %model.key, backend = %backend, "Compiling session");
                let compiled = self.factory.compile(model, bytes, backend).map_err(|err| {
                    PipelineError::BackendInit {
                        key: model.key.clone(),
                        backend,
                        detail: format!("{err:#}"),
                    }
                })?;
                self.compile_count += 1;
                entry.insert(compiled)
            }
        };

        Ok(session.as_mut())
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.sessions.remove(key).is_some()
    }

    /// Drop every session and forget the active backend.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.active_backend = None;
    }

    pub fn has_session(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Total sessions compiled over this manager's lifetime.
    pub fn compile_count(&self) -> usize {
        self.compile_count
    }
}

/// [`SessionFactory`] backed by ONNX Runtime.
#[derive(Debug, Clone, Default)]
pub struct OrtSessionFactory {
    trt_cache_dir: Option<PathBuf>,
}

impl OrtSessionFactory {
    pub fn new(trt_cache_dir: Option<PathBuf>) -> Self {
        Self { trt_cache_dir }
    }
}

impl SessionFactory for OrtSessionFactory {
    fn compile(
        &self,
        model: &ModelDescriptor,
        bytes: &[u8],
        backend: InferenceBackend,
    ) -> Result<Box<dyn InferenceSession>> {
        let config = SessionConfig {
            backend,
            trt_cache_dir: self.trt_cache_dir.clone(),
        };
        let session = build_session(bytes, &config)
            .with_context(|| format!("Failed to build session for {}", model.key))?;
        Ok(Box::new(OrtSession::new(session, model)?))
    }
}

pub struct OrtSession {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    model: ModelDescriptor,
}

impl OrtSession {
    pub fn new(session: Session, model: &ModelDescriptor) -> Result<Self> {
        model.validate()?;
        let input_name = session
            .inputs()
            .first()
            .context("Model declares no inputs")?
            .name()
            .to_string();
        let output_name = session
            .outputs()
            .first()
            .context("Model declares no outputs")?
            .name()
            .to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(model = %model.key, %input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
            model: model.clone(),
        })
    }
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: &PlanarTensor) -> Result<PlanarTensor> {
        let h = input.height() as usize;
        let w = input.width() as usize;

        let model = &self.model;
        let normalized = input.array().mapv(|v| model.normalize(v));
        let padded = pad_nchw(&normalized, model.pad_align as usize);

        let output = if self.is_fp16 {
            run_fp16(&mut self.session, &padded, &self.input_name, &self.output_name)?
        } else {
            run_fp32(&mut self.session, padded, &self.input_name, &self.output_name)?
        };
        let output = output
            .into_dimensionality::<Ix4>()
            .context("Model output is not a 4-D tensor")?;

        let out_h = h * model.scale as usize;
        let out_w = w * model.scale as usize;
        let shape = output.shape();
        if shape[1] != 3 || shape[2] < out_h || shape[3] < out_w {
            bail!(
                "Model output shape {:?} is smaller than expected [1, 3, {out_h}, {out_w}]",
                shape
            );
        }

        let cropped = output
            .slice(s![.., .., ..out_h, ..out_w])
            .mapv(|v| model.denormalize(v));
        PlanarTensor::from_array(cropped)
    }
}

fn run_fp32(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_fp16(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let f32_slice = input
        .as_slice()
        .context("Input tensor must be contiguous for f16 conversion")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("Model output is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
}

/// Pad H and W up to multiples of `align` by mirroring the bottom/right
/// edges.
fn pad_nchw(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (n, c, h, w) = arr.dim();
    let new_h = h.div_ceil(align) * align;
    let new_w = w.div_ceil(align) * align;
    if new_h == h && new_w == w {
        return arr.clone();
    }

    Array4::from_shape_fn((n, c, new_h, new_w), |(b, ch, y, x)| {
        arr[[b, ch, mirror(y, h), mirror(x, w)]]
    })
}

fn mirror(i: usize, len: usize) -> usize {
    if i < len {
        i
    } else {
        len.saturating_sub(1 + (i - len))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model_registry::{ModelCatalog, FACE_MODEL_KEY, SUPER_RES_MODEL_KEY};

    struct Identity;

    impl InferenceSession for Identity {
        fn run(&mut self, input: &PlanarTensor) -> Result<PlanarTensor> {
            Ok(input.clone())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        compiled: Mutex<Vec<(String, InferenceBackend)>>,
        fail_on: Option<InferenceBackend>,
    }

    impl SessionFactory for RecordingFactory {
        fn compile(
            &self,
            model: &ModelDescriptor,
            _bytes: &[u8],
            backend: InferenceBackend,
        ) -> Result<Box<dyn InferenceSession>> {
            if self.fail_on == Some(backend) {
                bail!("{backend} unavailable");
            }
            self.compiled
                .lock()
                .unwrap()
                .push((model.key.clone(), backend));
            Ok(Box::new(Identity))
        }
    }

    fn models() -> (ModelDescriptor, ModelDescriptor) {
        let catalog = ModelCatalog::with_builtin_models();
        (
            catalog.get(FACE_MODEL_KEY).unwrap().clone(),
            catalog.get(SUPER_RES_MODEL_KEY).unwrap().clone(),
        )
    }

    #[test]
    fn test_ensure_is_idempotent_per_backend() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = SessionManager::new(factory.clone());
        let (face, sr) = models();

        manager.ensure(&face, b"f", InferenceBackend::Cpu).unwrap();
        manager.ensure(&sr, b"s", InferenceBackend::Cpu).unwrap();
        manager.ensure(&face, b"f", InferenceBackend::Cpu).unwrap();

        assert_eq!(manager.compile_count(), 2);
        assert!(manager.has_session(FACE_MODEL_KEY));
        assert!(manager.has_session(SUPER_RES_MODEL_KEY));
    }

    #[test]
    fn test_backend_change_invalidates_all_sessions() {
        let factory = Arc::new(RecordingFactory::default());
        let mut manager = SessionManager::new(factory.clone());
        let (face, sr) = models();

        manager.ensure(&face, b"f", InferenceBackend::Cpu).unwrap();
        manager.ensure(&sr, b"s", InferenceBackend::Cpu).unwrap();

        assert!(manager.select_backend(InferenceBackend::Cuda));
        assert!(!manager.has_session(FACE_MODEL_KEY));
        assert!(!manager.has_session(SUPER_RES_MODEL_KEY));
        assert!(!manager.select_backend(InferenceBackend::Cuda));

        manager.ensure(&sr, b"s", InferenceBackend::Cuda).unwrap();
        manager.ensure(&face, b"f", InferenceBackend::Cpu).unwrap();

        let compiled = factory.compiled.lock().unwrap().clone();
        assert_eq!(
            compiled,
            vec![
                (FACE_MODEL_KEY.to_string(), InferenceBackend::Cpu),
                (SUPER_RES_MODEL_KEY.to_string(), InferenceBackend::Cpu),
                (SUPER_RES_MODEL_KEY.to_string(), InferenceBackend::Cuda),
                (FACE_MODEL_KEY.to_string(), InferenceBackend::Cpu),
            ]
        );
        assert!(!manager.has_session(SUPER_RES_MODEL_KEY));
    }

    #[test]
    fn test_compile_failure_maps_to_backend_init() {
        let factory = Arc::new(RecordingFactory {
            fail_on: Some(InferenceBackend::Tensorrt),
            ..Default::default()
        });
        let mut manager = SessionManager::new(factory);
        let (face, _) = models();

        let err = manager
            .ensure(&face, b"f", InferenceBackend::Tensorrt)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::BackendInit {
                backend: InferenceBackend::Tensorrt,
                ..
            }
        ));
        assert!(!manager.has_session(FACE_MODEL_KEY));
        assert_eq!(manager.compile_count(), 0);
    }

    #[test]
    fn test_reset_and_invalidate() {
        let mut manager = SessionManager::new(Arc::new(RecordingFactory::default()));
        let (face, sr) = models();
        manager.ensure(&face, b"f", InferenceBackend::Cpu).unwrap();
        manager.ensure(&sr, b"s", InferenceBackend::Cpu).unwrap();

        assert!(manager.invalidate(FACE_MODEL_KEY));
        assert!(!manager.invalidate(FACE_MODEL_KEY));
        assert!(manager.has_session(SUPER_RES_MODEL_KEY));

        manager.reset();
        assert!(!manager.has_session(SUPER_RES_MODEL_KEY));
        assert_eq!(manager.active_backend(), None);
    }

    #[test]
    fn test_pad_nchw_mirrors_edges() {
        let arr = Array4::from_shape_fn((1, 3, 2, 3), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
        let padded = pad_nchw(&arr, 4);
        assert_eq!(padded.dim(), (1, 3, 4, 4));
        assert_eq!(padded[[0, 0, 1, 2]], 12.0);
        // Row 2 mirrors row 1, row 3 mirrors row 0.
        assert_eq!(padded[[0, 1, 2, 0]], 110.0);
        assert_eq!(padded[[0, 1, 3, 0]], 100.0);
        // Column 3 mirrors column 2.
        assert_eq!(padded[[0, 2, 0, 3]], 202.0);
        assert_eq!(padded[[0, 2, 3, 3]], 202.0);
    }

    #[test]
    fn test_pad_nchw_aligned_is_unchanged() {
        let arr = Array4::from_elem((1, 3, 4, 8), 0.5f32);
        assert_eq!(pad_nchw(&arr, 4), arr);
        assert_eq!(pad_nchw(&arr, 1), arr);
    }

    #[test]
    fn test_mirror_handles_tiny_inputs() {
        assert_eq!(mirror(0, 1), 0);
        assert_eq!(mirror(3, 1), 0);
        assert_eq!(mirror(2, 2), 1);
        assert_eq!(mirror(3, 2), 0);
        assert_eq!(mirror(6, 2), 0);
    }
}
