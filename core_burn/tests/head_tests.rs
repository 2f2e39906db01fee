// core_burn/tests/head_tests.rs

use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use core_burn::{Embeddings, PartIndex, ProjectionHeadConfig, StreamLogits};

type TestBackend = NdArray<f32>;

fn embeddings(batch: usize) -> Tensor<TestBackend, 2> {
    Tensor::random([batch, 16], Distribution::Normal(0.0, 1.0), &Default::default())
}

fn tiny_head() -> ProjectionHeadConfig {
    ProjectionHeadConfig::new(16, 8)
        .with_hidden_dim(32)
        .with_bottleneck_dim(8)
}

#[test]
fn all_parts_produces_four_streams() {
    let head = tiny_head().init::<TestBackend>(&Default::default()).unwrap();
    let out = head.forward(Embeddings::AllParts {
        cls: embeddings(4),
        parts: [embeddings(4), embeddings(4), embeddings(4)],
    });
    match out {
        StreamLogits::AllStreams { cls, pt1, pt2, pt3 } => {
            for t in [cls, pt1, pt2, pt3] {
                assert_eq!(t.dims(), [4, 8]);
            }
        }
        StreamLogits::PartStream { .. } => panic!("ожидались все потоки"),
    }
}

#[test]
fn part_embedding_goes_to_its_own_sub_head() {
    let head = tiny_head().init::<TestBackend>(&Default::default()).unwrap();
    let part = embeddings(3);
    let out = head.forward(Embeddings::Part {
        cls: embeddings(3),
        part: part.clone(),
        index: PartIndex::Middle,
    });
    let StreamLogits::PartStream { part: logits, index, .. } = out else {
        panic!("ожидался режим одной части");
    };
    assert_eq!(index, PartIndex::Middle);

    let expected = head
        .sub_head(PartIndex::Middle.stream())
        .forward(part);
    assert_eq!(logits.into_data(), expected.into_data());
}

#[test]
fn weight_norm_columns_are_unit_when_gain_is_fixed() {
    let head = tiny_head().init::<TestBackend>(&Default::default()).unwrap();
    let weight = head.sub_head(core_burn::Stream::Cls).last_layer().weight();
    let norms = weight
        .powf_scalar(2.0)
        .sum_dim(0)
        .sqrt()
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    assert_eq!(norms.len(), 8);
    for n in norms {
        approx::assert_abs_diff_eq!(n, 1.0, epsilon = 1e-5);
    }
}

#[test]
fn last_layer_ids_include_gain_only_when_trainable() {
    let fixed = tiny_head().init::<TestBackend>(&Default::default()).unwrap();
    assert_eq!(fixed.last_layer_param_ids().len(), 4);

    let trainable = tiny_head()
        .with_norm_last_layer(false)
        .init::<TestBackend>(&Default::default())
        .unwrap();
    assert_eq!(trainable.last_layer_param_ids().len(), 8);
}

#[test]
fn single_layer_and_batch_norm_variants() {
    let single = tiny_head()
        .with_nlayers(1)
        .init::<TestBackend>(&Default::default())
        .unwrap();
    let out = single.sub_head(core_burn::Stream::Part3).forward(embeddings(2));
    assert_eq!(out.dims(), [2, 8]);

    let with_bn = tiny_head()
        .with_use_bn(true)
        .init::<TestBackend>(&Default::default())
        .unwrap();
    let out = with_bn.sub_head(core_burn::Stream::Cls).forward(embeddings(5));
    assert_eq!(out.dims(), [5, 8]);
}

#[test]
fn zero_dims_are_rejected() {
    assert!(ProjectionHeadConfig::new(16, 0)
        .init::<TestBackend>(&Default::default())
        .is_err());
}

#[test]
fn batch_norm_uses_batch_statistics_without_autodiff() {
    use burn::module::AutodiffModule;
    use burn_autodiff::Autodiff;

    type TrainBackend = Autodiff<TestBackend>;

    let head = tiny_head()
        .with_use_bn(true)
        .init::<TrainBackend>(&Default::default())
        .unwrap();
    let input = embeddings(6);

    let train_out = head
        .sub_head(core_burn::Stream::Cls)
        .forward(Tensor::from_inner(input.clone()))
        .inner()
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    let valid_out = head
        .valid()
        .sub_head(core_burn::Stream::Cls)
        .forward(input)
        .into_data()
        .to_vec::<f32>()
        .unwrap();

    // Учитель без графа вычислений нормализует так же, как студент при обучении.
    for (a, b) in train_out.iter().zip(&valid_out) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}
