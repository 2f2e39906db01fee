// training_engine/tests/ema_tests.rs

mod common;

use burn::nn::{Linear, LinearConfig};
use common::{flat_values, tiny_network_config, Inner};
use core_burn::MultiCropNetwork;
use training_engine::{ema_update, TrainingError};

fn two_networks() -> (MultiCropNetwork<Inner>, MultiCropNetwork<Inner>) {
    let device = Default::default();
    let config = tiny_network_config();
    (config.init(&device).unwrap(), config.init(&device).unwrap())
}

#[test]
fn momentum_one_keeps_teacher() {
    let (student, teacher) = two_networks();
    let before = flat_values(&teacher);
    let teacher = ema_update(&student, teacher, 1.0).unwrap();
    assert_eq!(flat_values(&teacher), before);
}

#[test]
fn momentum_zero_copies_student() {
    let (student, teacher) = two_networks();
    let teacher = ema_update(&student, teacher, 0.0).unwrap();
    assert_eq!(flat_values(&teacher), flat_values(&student));
}

#[test]
fn intermediate_momentum_interpolates() {
    let device = Default::default();
    let student: Linear<Inner> = LinearConfig::new(3, 2).init(&device);
    let teacher: Linear<Inner> = LinearConfig::new(3, 2).init(&device);
    let (s, t) = (flat_values(&student), flat_values(&teacher));
    let updated = flat_values(&ema_update(&student, teacher, 0.75).unwrap());
    for ((u, s), t) in updated.iter().zip(&s).zip(&t) {
        approx::assert_abs_diff_eq!(*u, 0.75 * t + 0.25 * s, epsilon = 1e-6);
    }
}

#[test]
fn different_structures_are_rejected() {
    let device = Default::default();
    let student: Linear<Inner> = LinearConfig::new(3, 2).init(&device);
    let teacher: Linear<Inner> = LinearConfig::new(4, 2).init(&device);
    assert!(matches!(
        ema_update(&student, teacher, 0.5),
        Err(TrainingError::ParameterMismatch(_))
    ));
}
