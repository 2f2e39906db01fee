// core_burn/src/pos_embed.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Бикубическая интерполяция позиционных эмбеддингов патчей.
//!
//! Позиционные эмбеддинги обучаются для сетки патчей глобального вида, а
//! локальные виды имеют меньшую сетку. Бикубическая интерполяция линейна по
//! входу, поэтому выражается двумя матрицами весов `W_h` и `W_w`:
//! `out = W_h · P · W_wᵀ` (по каждому каналу). Матрицы вычисляются на хосте,
//! а сама интерполяция сводится к `matmul`, у которого есть обратный проход на
//! любом бэкенде.

use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Коэффициент бикубического ядра (как в `PyTorch`).
const CUBIC_A: f64 = -0.75;

/// Сдвиг размера выхода, избегающий ошибок округления коэффициента масштаба.
const SCALE_OFFSET: f64 = 0.1;

fn cubic_near(t: f64) -> f64 {
    ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0
}

fn cubic_far(t: f64) -> f64 {
    ((CUBIC_A * t - 5.0 * CUBIC_A) * t + 8.0 * CUBIC_A) * t - 4.0 * CUBIC_A
}

/// Матрица бикубической интерполяции `[out_len, in_len]` (построчно).
///
/// Соответствует `align_corners = false` и коэффициенту масштаба
/// `(out_len + 0.1) / in_len`; индексы за границами зажимаются к краю.
/// При `out_len == in_len` возвращается единичная матрица.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
pub fn bicubic_weights(in_len: usize, out_len: usize) -> Vec<f32> {
    let mut weights = vec![0.0_f32; out_len * in_len];
    if in_len == 0 {
        return weights;
    }
    if in_len == out_len {
        for i in 0..in_len {
            weights[i * in_len + i] = 1.0;
        }
        return weights;
    }
    let scale = in_len as f64 / (out_len as f64 + SCALE_OFFSET);
    let last = in_len as i64 - 1;
    for dst in 0..out_len {
        let src = (dst as f64 + 0.5).mul_add(scale, -0.5);
        let base = src.floor();
        let t = src - base;
        let coeffs = [cubic_far(t + 1.0), cubic_near(t), cubic_near(1.0 - t), cubic_far(2.0 - t)];
        for (offset, coeff) in coeffs.iter().enumerate() {
            let idx = (base as i64 - 1 + offset as i64).clamp(0, last) as usize;
            weights[dst * in_len + idx] += *coeff as f32;
        }
    }
    weights
}

/// Интерполирует позиционные эмбеддинги патчей `[1, gh*gw, dim]` на сетку `target`.
///
/// # Аргументы
/// * `pos_embed` - Эмбеддинги исходной сетки `grid = (gh, gw)`.
/// * `grid` - Исходная сетка `(высота, ширина)` в патчах.
/// * `target` - Целевая сетка `(высота, ширина)` в патчах.
///
/// # Возвращает
/// Тензор `[1, th*tw, dim]`. Для совпадающей сетки возвращается вход без изменений.
pub fn interpolate_pos_embed<B: Backend>(
    pos_embed: Tensor<B, 3>,
    grid: (usize, usize),
    target: (usize, usize),
) -> Tensor<B, 3> {
    if grid == target {
        return pos_embed;
    }
    let (gh, gw) = grid;
    let (th, tw) = target;
    let [_, _, dim] = pos_embed.dims();
    let device = pos_embed.device();

    let w_h = Tensor::<B, 2>::from_data(TensorData::new(bicubic_weights(gh, th), [th, gh]), &device);
    let w_w_t = Tensor::<B, 2>::from_data(TensorData::new(bicubic_weights(gw, tw), [tw, gw]), &device)
        .transpose();

    // По высоте: [th, gh] x [gh, gw*dim].
    let rows = w_h.matmul(pos_embed.reshape([gh, gw * dim]));
    // По ширине: [th*dim, gw] x [gw, tw].
    let cols = rows
        .reshape([th, gw, dim])
        .swap_dims(1, 2)
        .reshape([th * dim, gw])
        .matmul(w_w_t);
    cols.reshape([th, dim, tw])
        .swap_dims(1, 2)
        .reshape([1, th * tw, dim])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_for_same_size() {
        let w = bicubic_weights(3, 3);
        assert_eq!(w, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn rows_sum_to_one() {
        for (i, o) in [(14, 6), (4, 2), (2, 5), (7, 1)] {
            let w = bicubic_weights(i, o);
            for row in w.chunks(i) {
                let s: f32 = row.iter().sum();
                assert!((s - 1.0).abs() < 1e-5, "{i}->{o}: {s}");
            }
        }
    }
}
