//! Parameter-transplant integration tests: round-trip fidelity, the
//! transpose rule, and incompatible-source failures.

use candle_core::{Device, Tensor};
use vitcap_core::pretrained::{is_ignored, is_transposed, transplant, TransplantError};
use vitcap_core::testing::{synthetic_pretrained_source, tiny_caption_config};
use vitcap_core::CaptionModel;

fn tensors_equal(a: &Tensor, b: &Tensor) -> bool {
    let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| x == y)
}

#[test]
fn transplant_round_trips_every_transplantable_tensor() {
    let device = Device::Cpu;
    let cfg = tiny_caption_config();

    let donor = CaptionModel::new(&cfg, &device).unwrap();
    let source = synthetic_pretrained_source(&donor).unwrap();

    let model = CaptionModel::from_pretrained(&cfg, &source, &device).unwrap();

    let recipient = model.varmap().data().lock().unwrap();
    for (name, var) in recipient.iter() {
        if is_ignored(name) {
            continue;
        }
        let src = &source[name];
        // Source tensors for the four projection weights are stored
        // transposed; everything else is copied verbatim.
        let expected = if is_transposed(name) {
            src.t().unwrap().contiguous().unwrap()
        } else {
            src.copy().unwrap()
        };
        assert!(
            tensors_equal(var.as_tensor(), &expected),
            "{name} not reproduced from the source"
        );
    }
}

#[test]
fn ignored_parameters_keep_their_own_initialization() {
    let device = Device::Cpu;
    let cfg = tiny_caption_config();

    let donor = CaptionModel::new(&cfg, &device).unwrap();
    let source = synthetic_pretrained_source(&donor).unwrap();
    let model = CaptionModel::from_pretrained(&cfg, &source, &device).unwrap();

    let donor_vars = donor.varmap().data().lock().unwrap();
    let model_vars = model.varmap().data().lock().unwrap();
    let cross_attn_name = "transformer.h.0.cross_attn.q.weight";
    assert!(
        !tensors_equal(
            donor_vars[cross_attn_name].as_tensor(),
            model_vars[cross_attn_name].as_tensor(),
        ),
        "cross-attention should stay independently initialized"
    );
}

#[test]
fn missing_tensor_is_reported_by_name() {
    let device = Device::Cpu;
    let cfg = tiny_caption_config();

    let donor = CaptionModel::new(&cfg, &device).unwrap();
    let mut source = synthetic_pretrained_source(&donor).unwrap();
    source.remove("transformer.ln_f.weight");

    match CaptionModel::from_pretrained(&cfg, &source, &device) {
        Ok(_) => panic!("transplant should fail when a tensor is missing"),
        Err(TransplantError::MissingTensor(name)) => assert_eq!(name, "transformer.ln_f.weight"),
        Err(other) => panic!("expected MissingTensor, got {other}"),
    }
}

#[test]
fn shape_mismatch_fails_even_after_transpose_rule() {
    let device = Device::Cpu;
    let cfg = tiny_caption_config();

    let donor = CaptionModel::new(&cfg, &device).unwrap();
    let mut source = synthetic_pretrained_source(&donor).unwrap();

    // A transposed-convention weight with the wrong inner width cannot be
    // rescued by the transpose rule.
    let bad_shape = (cfg.embed_dim + 1, 3 * cfg.embed_dim);
    let bad = Tensor::zeros(bad_shape, candle_core::DType::F32, &device).unwrap();
    source.insert("transformer.h.0.attn.c_attn.weight".to_string(), bad);

    let model = CaptionModel::new(&cfg, &device).unwrap();
    let err = transplant(model.varmap(), &source).unwrap_err();
    assert!(matches!(err, TransplantError::ShapeMismatch { .. }), "got {err}");
}
