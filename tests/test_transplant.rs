use std::sync::Arc;

use ndarray::{ArrayD, Ix4, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rcnn_detect::common::{BackboneSpec, ClassifierSource, Composite, PretrainedRegistry, PretrainedSource};
use rcnn_detect::detection_runners::resnet::build_classifier;
use rcnn_detect::detection_runners::weight_transplant::{copy_params, copy_tree};
use rcnn_detect::{DetectorError, DetectorResult};

mod common;

#[derive(Debug)]
struct InMemoryClassifier(Composite);

impl ClassifierSource for InMemoryClassifier {
    fn load(&self, _backbone: &BackboneSpec) -> DetectorResult<Composite> {
        Ok(self.0.clone())
    }
}

fn registry(classifier: Composite) -> PretrainedRegistry {
    PretrainedRegistry::empty().with_classifier("imagenet", Arc::new(InMemoryClassifier(classifier)))
}

fn filled(shape: &[usize], value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(shape), value)
}

fn bn(value: f32) -> Composite {
    Composite::link()
        .with_param("gamma", filled(&[2], value))
        .with_persistent("avg_mean", filled(&[2], value))
        .with_scalar("N", value as i64)
}

fn tree(value: f32) -> Composite {
    Composite::chain()
        .with_child("bn1", bn(value))
        .with_child("res2", Composite::chain().with_child("a", Composite::chain().with_child("bn", bn(value))))
}

#[test]
fn copy_tree_moves_state_and_leaves_weights() {
    common::init_logger();
    let mut dst = tree(1.);
    let src = tree(5.);
    copy_tree(&mut dst, &src).unwrap();

    for path in ["bn1", "res2/a/bn"] {
        let Some(node) = dst.at(path).and_then(|n| n.as_composite()) else {
            panic!("{path} missing");
        };
        assert_eq!(node.array("avg_mean").unwrap(), &filled(&[2], 5.));
        assert_eq!(node.scalar("N"), Some(5));
        assert_eq!(node.array("gamma").unwrap(), &filled(&[2], 1.));
    }

    let once = dst.clone();
    copy_tree(&mut dst, &src).unwrap();
    assert_eq!(dst, once);
}

#[test]
fn copy_params_then_tree_makes_trees_equal() {
    let mut dst = tree(1.);
    let src = tree(2.);
    copy_params(&mut dst, &src).unwrap();
    copy_tree(&mut dst, &src).unwrap();
    assert_eq!(dst, src);
}

#[test]
fn differing_child_names_are_fatal() {
    let mut dst = tree(1.);
    let src = Composite::chain()
        .with_child("bn1", bn(2.))
        .with_child("res3", Composite::chain());
    let err = copy_tree(&mut dst, &src).unwrap_err();
    assert!(matches!(err, DetectorError::StructuralMismatch { .. }), "{err}");
}

#[test]
fn array_cannot_receive_a_scalar() {
    let mut dst = Composite::link().with_persistent("N", filled(&[1], 0.));
    let src = Composite::link().with_scalar("N", 3);
    let err = copy_tree(&mut dst, &src).unwrap_err();
    assert!(matches!(err, DetectorError::TypeTransplant { .. }), "{err}");
}

#[test]
fn classifier_stages_land_in_extractor_and_head() {
    common::init_logger();
    let classifier = build_classifier(&common::tiny_spec("tiny"), &mut StdRng::seed_from_u64(3));
    let model = common::build_tiny(
        common::tiny_config(),
        PretrainedSource::Named("imagenet".into()),
        &registry(classifier.clone()),
    )
    .unwrap();

    let extractor = model.params().child("extractor").unwrap();
    for stage in ["bn1", "res2", "res3", "res4"] {
        assert_eq!(extractor.child(stage), classifier.child(stage), "{stage}");
    }
    assert_eq!(model.params().child("head").unwrap().child("res5"), classifier.child("res5"));
    assert!(model.params().at("head/fc6").is_none());

    let dst = extractor.child("conv1").unwrap().array("W").unwrap();
    let src = classifier.child("conv1").unwrap().array("W").unwrap();
    assert_eq!(dst.shape(), src.shape());
    let dst = dst.view().into_dimensionality::<Ix4>().unwrap();
    let src = src.view().into_dimensionality::<Ix4>().unwrap();
    for ((o, c, i, j), &v) in dst.indexed_iter() {
        assert_eq!(v, src[[o, 2 - c, i, j]]);
    }
    assert_eq!(
        extractor.child("conv1").unwrap().array("b"),
        classifier.child("conv1").unwrap().array("b")
    );
}

#[test]
fn stages_missing_from_the_classifier_keep_initial_values() {
    let mut classifier = build_classifier(&common::tiny_spec("tiny"), &mut StdRng::seed_from_u64(3));
    classifier.remove("res4");
    let model = common::build_tiny(
        common::tiny_config(),
        PretrainedSource::Named("imagenet".into()),
        &registry(classifier.clone()),
    )
    .unwrap();
    let res4 = model.params().at("extractor/res4").and_then(|n| n.as_composite()).unwrap();
    assert_ne!(Some(res4), classifier.child("res4"));
    assert_eq!(model.params().at("extractor/res2").and_then(|n| n.as_composite()), classifier.child("res2"));
}

#[test]
fn deeper_classifier_is_a_structural_mismatch() {
    let deeper = BackboneSpec::new("tiny", [1, 2, 1, 1], 2);
    let classifier = build_classifier(&deeper, &mut StdRng::seed_from_u64(3));
    let err = common::build_tiny(
        common::tiny_config(),
        PretrainedSource::Named("imagenet".into()),
        &registry(classifier),
    )
    .unwrap_err();
    assert!(matches!(err, DetectorError::StructuralMismatch { .. }), "{err}");
}
