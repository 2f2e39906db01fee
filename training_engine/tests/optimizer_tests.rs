// training_engine/tests/optimizer_tests.rs

mod common;

use approx::assert_abs_diff_eq;
use burn::{
    nn::{Linear, LinearConfig},
    tensor::Tensor,
};
use common::{host, Inner};
use training_engine::{
    optimizer::{cancel_last_layer_gradients, clip_gradients, gradient_norms},
    params::from_host,
    DistillationOptimizer, LossScaler, ParamGroup, ParamRegistry, StepSettings, TrainingError,
};
use utils_crate::OptimizerKind;

fn linear() -> Linear<Inner> {
    LinearConfig::new(2, 2).init(&Default::default())
}

fn constant_grads(registry: &ParamRegistry, value: f32) -> Vec<Option<Tensor<Inner, 1>>> {
    registry
        .slots()
        .iter()
        .map(|slot| Some(from_host(vec![value; slot.num_elements()], &Default::default())))
        .collect()
}

#[test]
fn registry_groups_by_rank() {
    let registry = ParamRegistry::from_module(&linear(), &[]);
    let groups: Vec<ParamGroup> = registry.slots().iter().map(|slot| slot.group).collect();
    assert_eq!(groups, vec![ParamGroup::Regularized, ParamGroup::NotRegularized]);
    assert_eq!(registry.num_elements(), 6);
}

#[test]
fn adamw_first_step_moves_by_lr_and_decays_matrices_only() {
    let module = linear();
    let registry = ParamRegistry::from_module(&module, &[]);
    let params = registry.collect_values(&module).unwrap();
    let before: Vec<Vec<f32>> = params.iter().map(|p| host(p.clone())).collect();

    let mut optimizer = DistillationOptimizer::<Inner>::new(OptimizerKind::Adamw, &registry);
    let settings = StepSettings {
        lr: 0.1,
        weight_decay: 0.5,
    };
    let updated = optimizer
        .step(params, constant_grads(&registry, 0.5), settings)
        .unwrap();

    let weight = host(updated[0].clone().unwrap());
    for (new, old) in weight.iter().zip(&before[0]) {
        assert_abs_diff_eq!(*new, old * (1.0 - 0.05) - 0.1, epsilon = 1e-5);
    }
    let bias = host(updated[1].clone().unwrap());
    for (new, old) in bias.iter().zip(&before[1]) {
        assert_abs_diff_eq!(*new, old - 0.1, epsilon = 1e-5);
    }
}

#[test]
fn sgd_uses_momentum_buffer() {
    let module = linear();
    let registry = ParamRegistry::from_module(&module, &[]);
    let mut optimizer = DistillationOptimizer::<Inner>::new(OptimizerKind::Sgd, &registry);
    let settings = StepSettings {
        lr: 1.0,
        weight_decay: 0.0,
    };
    let start = host(registry.collect_values(&module).unwrap()[1].clone());

    let first = optimizer
        .step(registry.collect_values(&module).unwrap(), constant_grads(&registry, 1.0), settings)
        .unwrap();
    let params: Vec<Tensor<Inner, 1>> = first.into_iter().map(Option::unwrap).collect();
    let second = optimizer
        .step(params, constant_grads(&registry, 1.0), settings)
        .unwrap();
    // Второй шаг: буфер 0.9 * 1 + 1 = 1.9.
    let bias = host(second[1].clone().unwrap());
    for (new, old) in bias.iter().zip(&start) {
        assert_abs_diff_eq!(*new, old - 1.0 - 1.9, epsilon = 1e-5);
    }
}

#[test]
fn lars_skips_adaptation_for_vectors() {
    let module = linear();
    let registry = ParamRegistry::from_module(&module, &[]);
    let params = registry.collect_values(&module).unwrap();
    let bias_before = host(params[1].clone());
    let mut optimizer = DistillationOptimizer::<Inner>::new(OptimizerKind::Lars, &registry);
    let updated = optimizer
        .step(
            params,
            constant_grads(&registry, 1.0),
            StepSettings {
                lr: 0.1,
                weight_decay: 0.0,
            },
        )
        .unwrap();
    let bias = host(updated[1].clone().unwrap());
    for (new, old) in bias.iter().zip(&bias_before) {
        assert_abs_diff_eq!(*new, old - 0.1, epsilon = 1e-6);
    }
}

#[test]
fn missing_gradients_are_skipped() {
    let module = linear();
    let registry = ParamRegistry::from_module(&module, &[]);
    let mut optimizer = DistillationOptimizer::<Inner>::new(OptimizerKind::Adamw, &registry);
    let mut grads = constant_grads(&registry, 1.0);
    grads[0] = None;
    let updated = optimizer
        .step(
            registry.collect_values(&module).unwrap(),
            grads,
            StepSettings {
                lr: 0.1,
                weight_decay: 0.0,
            },
        )
        .unwrap();
    assert!(updated[0].is_none());
    assert!(updated[1].is_some());
    let record = optimizer.to_record();
    assert_eq!(record.steps, vec![0, 1]);
}

#[test]
fn wrong_lengths_are_rejected() {
    let module = linear();
    let registry = ParamRegistry::from_module(&module, &[]);
    let mut optimizer = DistillationOptimizer::<Inner>::new(OptimizerKind::Sgd, &registry);
    let result = optimizer.step(
        registry.collect_values(&module).unwrap(),
        vec![None],
        StepSettings {
            lr: 0.1,
            weight_decay: 0.0,
        },
    );
    assert!(matches!(result, Err(TrainingError::ParameterMismatch(_))));
}

#[test]
fn clipping_limits_each_gradient_norm() {
    let device = Default::default();
    let grads: Vec<Option<Tensor<Inner, 1>>> = vec![
        Some(from_host(vec![3.0, 4.0], &device)),
        Some(from_host(vec![0.3, 0.4], &device)),
        None,
    ];
    let norms = gradient_norms(&grads);
    assert_abs_diff_eq!(norms[0].unwrap(), 5.0, epsilon = 1e-6);
    assert!(norms[2].is_none());

    let clipped = clip_gradients(grads, &norms, 1.0);
    let first = host(clipped[0].clone().unwrap());
    assert_abs_diff_eq!(first[0], 0.6, epsilon = 1e-5);
    assert_abs_diff_eq!(first[1], 0.8, epsilon = 1e-5);
    let second = host(clipped[1].clone().unwrap());
    assert_abs_diff_eq!(second[0], 0.3, epsilon = 1e-7);
}

#[test]
fn last_layer_gradients_are_dropped_while_frozen() {
    let module = linear();
    let bias_id = module.bias.as_ref().unwrap().id;
    let registry = ParamRegistry::from_module(&module, &[bias_id]);

    let frozen = cancel_last_layer_gradients(constant_grads(&registry, 1.0), &registry, 0, 1);
    assert!(frozen[0].is_some());
    assert!(frozen[1].is_none());

    let thawed = cancel_last_layer_gradients(constant_grads(&registry, 1.0), &registry, 1, 1);
    assert!(thawed.iter().all(Option::is_some));
}

#[test]
fn scaler_backs_off_and_grows() {
    let mut scaler = LossScaler {
        growth_interval: 2,
        ..LossScaler::default()
    };
    scaler.update(true);
    assert_abs_diff_eq!(scaler.scale, 32768.0);
    scaler.update(false);
    assert_abs_diff_eq!(scaler.scale, 32768.0);
    scaler.update(false);
    assert_abs_diff_eq!(scaler.scale, 65536.0);
    assert_eq!(scaler.growth_tracker, 0);

    let grads = scaler.unscale(vec![Some(from_host::<Inner>(vec![65536.0], &Default::default())), None]);
    assert_abs_diff_eq!(host(grads[0].clone().unwrap())[0], 1.0);
}
