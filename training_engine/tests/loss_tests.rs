// training_engine/tests/loss_tests.rs

mod common;

use std::{sync::Arc, thread};

use approx::assert_abs_diff_eq;
use burn::tensor::{Distribution, Tensor, TensorData};
use common::{host, Inner, TestBackend};
use core_burn::Stream;
use training_engine::{
    Collective, DistillationLoss, SingleProcess, StudentLogits, TeacherLogits, ThreadGroup, TrainingError,
};

const DIM: usize = 5;
const BATCH: usize = 3;

fn teacher_logits(seed_value: f32) -> TeacherLogits<Inner> {
    let device = Default::default();
    let values: Vec<f32> = (0..2 * BATCH * DIM).map(|i| seed_value * (i as f32 * 0.37).sin()).collect();
    let t = Tensor::<Inner, 2>::from_data(TensorData::new(values, [2 * BATCH, DIM]), &device);
    TeacherLogits {
        streams: std::array::from_fn(|_| t.clone()),
    }
}

fn student_logits(views: usize) -> StudentLogits<TestBackend> {
    let device = Default::default();
    StudentLogits {
        streams: std::array::from_fn(|_| {
            (0..views)
                .map(|_| Tensor::random([BATCH, DIM], Distribution::Normal(0.0, 1.0), &device))
                .collect()
        }),
    }
}

fn loss(center_momentum: f64) -> DistillationLoss<TestBackend> {
    DistillationLoss::new(DIM, vec![0.04, 0.07], 0.1, center_momentum, &Default::default())
}

#[test]
fn single_worker_is_deterministic() {
    let teacher = teacher_logits(1.0);
    let student = student_logits(4);
    let a = loss(0.9).compute(&teacher, &student, 0, &SingleProcess).unwrap();
    let b = loss(0.9).compute(&teacher, &student, 0, &SingleProcess).unwrap();
    assert_eq!(host(a.loss.inner()), host(b.loss.inner()));
}

#[test]
fn counts_pairs_per_stream() {
    let teacher = teacher_logits(1.0);
    let out = loss(0.9).compute(&teacher, &student_logits(5), 1, &SingleProcess).unwrap();
    // Два вида учителя против пяти видов студента без совпадающих пар.
    assert_eq!(out.terms, [8, 8, 8, 8]);
    assert_eq!(out.total_terms(), 32);
    assert!(host(out.loss.inner())[0].is_finite());
}

#[test]
fn without_local_views_two_terms_per_stream() {
    let out = loss(0.9)
        .compute(&teacher_logits(1.0), &student_logits(2), 0, &SingleProcess)
        .unwrap();
    assert_eq!(out.terms, [2, 2, 2, 2]);
}

#[test]
fn empty_student_lists_are_an_error() {
    let result = loss(0.9).compute(&teacher_logits(1.0), &student_logits(0), 0, &SingleProcess);
    assert!(matches!(result, Err(TrainingError::NoLossTerms)));
}

#[test]
fn mismatched_batch_is_a_shape_error() {
    let device = Default::default();
    let mut student = student_logits(3);
    student.streams[0][2] = Tensor::zeros([BATCH + 1, DIM], &device);
    let result = loss(0.9).compute(&teacher_logits(1.0), &student, 0, &SingleProcess);
    assert!(matches!(result, Err(TrainingError::Shape(_))));
}

#[test]
fn epoch_outside_temperature_schedule_is_an_error() {
    let result = loss(0.9).compute(&teacher_logits(1.0), &student_logits(3), 2, &SingleProcess);
    assert!(matches!(result, Err(TrainingError::Schedule(_))));
}

#[test]
fn centers_follow_moving_average() {
    let teacher = teacher_logits(2.0);
    let mut loss = loss(0.9);
    loss.compute(&teacher, &student_logits(3), 0, &SingleProcess).unwrap();

    let logits = host(teacher.stream(Stream::Cls).clone());
    for stream in Stream::ALL {
        let center = host(loss.center(stream).clone());
        assert_eq!(center.len(), DIM);
        for (j, value) in center.iter().enumerate() {
            let mean: f32 = (0..2 * BATCH).map(|r| logits[r * DIM + j]).sum::<f32>() / (2 * BATCH) as f32;
            assert_abs_diff_eq!(*value, 0.1 * mean, epsilon = 1e-6);
        }
    }
}

#[test]
fn momentum_one_keeps_centers() {
    let mut loss = loss(1.0);
    loss.compute(&teacher_logits(1.0), &student_logits(3), 0, &SingleProcess)
        .unwrap();
    for stream in Stream::ALL {
        assert!(host(loss.center(stream).clone()).iter().all(|v| *v == 0.0));
    }
}

#[test]
fn record_round_trip_restores_centers() {
    let mut trained = loss(0.5);
    trained
        .compute(&teacher_logits(3.0), &student_logits(3), 0, &SingleProcess)
        .unwrap();
    let mut fresh = loss(0.5);
    fresh.load_record(trained.to_record()).unwrap();
    for stream in Stream::ALL {
        assert_eq!(host(fresh.center(stream).clone()), host(trained.center(stream).clone()));
    }
}

#[test]
fn centers_agree_across_thread_group() {
    let group = ThreadGroup::new(2);
    let handles: Vec<_> = group
        .into_iter()
        .map(|member| {
            thread::spawn(move || {
                let collective: Arc<dyn Collective> = Arc::new(member);
                let scale = 1.0 + collective.rank() as f32;
                let mut loss = loss(0.9);
                loss.compute(&teacher_logits(scale), &student_logits(3), 0, collective.as_ref())
                    .unwrap();
                host(loss.center(Stream::Part2).clone())
            })
        })
        .collect();
    let centers: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(centers[0], centers[1]);

    // Среднее по всем строкам обоих участников: масштабы 1 и 2 дают 1.5.
    let base = host(teacher_logits(1.0).stream(Stream::Part2).clone());
    for (j, value) in centers[0].iter().enumerate() {
        let mean: f32 = (0..2 * BATCH).map(|r| base[r * DIM + j]).sum::<f32>() / (2 * BATCH) as f32;
        assert_abs_diff_eq!(*value, 0.1 * 1.5 * mean, epsilon = 1e-5);
    }
}

/// Логиты студента без случайности: `[поток][вид]` строки `[BATCH, DIM]`.
fn fixed_student_values(views: [usize; 4]) -> Vec<Vec<Vec<f32>>> {
    views
        .iter()
        .enumerate()
        .map(|(s, &count)| {
            (0..count)
                .map(|v| {
                    (0..BATCH * DIM)
                        .map(|i| 1.3 * ((i as f32) * 0.23 + (v as f32) * 0.71 + (s as f32) * 1.9).cos())
                        .collect()
                })
                .collect()
        })
        .collect()
}

fn log_softmax_f64(row: &[f64]) -> Vec<f64> {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = row.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max;
    row.iter().map(|x| x - log_sum).collect()
}

#[test]
fn loss_matches_reference_formula() {
    let device = Default::default();
    let mut loss = loss(0.9);
    // Первый шаг делает центры ненулевыми.
    loss.compute(&teacher_logits(2.0), &student_logits(3), 0, &SingleProcess)
        .unwrap();

    let epoch = 1;
    let teacher_temp = 0.07;
    let student_temp = 0.1;
    let views = [5, 3, 3, 3];
    let values = fixed_student_values(views);
    let student = StudentLogits::<TestBackend> {
        streams: std::array::from_fn(|s| {
            values[s]
                .iter()
                .map(|view| Tensor::from_data(TensorData::new(view.clone(), [BATCH, DIM]), &device))
                .collect()
        }),
    };
    let teacher = teacher_logits(1.0);

    let mut expected_total = 0.0_f64;
    let mut expected_terms = 0_usize;
    for stream in Stream::ALL {
        let s = stream.index();
        let t = host(teacher.stream(stream).clone());
        let c = host(loss.center(stream).clone());
        assert!(c.iter().any(|value| *value != 0.0));
        for iq in 0..2 {
            for (v, view) in values[s].iter().enumerate() {
                if v == iq {
                    continue;
                }
                let mut term = 0.0;
                for b in 0..BATCH {
                    let row = iq * BATCH + b;
                    let scaled: Vec<f64> = (0..DIM)
                        .map(|j| f64::from(t[row * DIM + j] - c[j]) / teacher_temp)
                        .collect();
                    let q: Vec<f64> = log_softmax_f64(&scaled).into_iter().map(f64::exp).collect();
                    let s_row: Vec<f64> = (0..DIM).map(|j| f64::from(view[b * DIM + j]) / student_temp).collect();
                    let log_p = log_softmax_f64(&s_row);
                    term += q.iter().zip(&log_p).map(|(q, lp)| -q * lp).sum::<f64>();
                }
                expected_total += term / BATCH as f64;
                expected_terms += 1;
            }
        }
    }
    let expected = expected_total / expected_terms as f64;

    let out = loss.compute(&teacher, &student, epoch, &SingleProcess).unwrap();
    assert_eq!(out.terms, [8, 4, 4, 4]);
    assert_eq!(expected_terms, 20);
    let got = f64::from(host(out.loss.inner())[0]);
    assert_abs_diff_eq!(got, expected, epsilon = 1e-4);
}
