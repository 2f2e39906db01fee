// core_burn/src/part.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Потоки представления и выбор части.

use std::fmt;

/// Количество part-токенов (и горизонтальных полос изображения).
pub const NUM_PARTS: usize = 3;

/// Один из четырех параллельных потоков: глобальный и три частичных.
///
/// У каждого потока своя подголова, свое пространство логитов и свой центр.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Глобальный поток `[CLS]` токена.
    Cls,
    /// Верхняя полоса.
    Part1,
    /// Средняя полоса.
    Part2,
    /// Нижняя полоса.
    Part3,
}

impl Stream {
    /// Все потоки в каноническом порядке.
    pub const ALL: [Self; 4] = [Self::Cls, Self::Part1, Self::Part2, Self::Part3];

    /// Позиция потока в каноническом порядке.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cls => 0,
            Self::Part1 => 1,
            Self::Part2 => 2,
            Self::Part3 => 3,
        }
    }

    /// Короткое имя потока для логов.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cls => "cls",
            Self::Part1 => "pt1",
            Self::Part2 => "pt2",
            Self::Part3 => "pt3",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Индекс горизонтальной полосы.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartIndex {
    /// Строки `[0, h/2)`.
    Top,
    /// Строки `[h/4, 3h/4)`.
    Middle,
    /// Строки `[h/2, h)`.
    Bottom,
}

impl PartIndex {
    /// Все полосы по порядку.
    pub const ALL: [Self; NUM_PARTS] = [Self::Top, Self::Middle, Self::Bottom];

    /// Числовой индекс полосы (0, 1, 2).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Top => 0,
            Self::Middle => 1,
            Self::Bottom => 2,
        }
    }

    /// Полоса по числовому индексу.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Top),
            1 => Some(Self::Middle),
            2 => Some(Self::Bottom),
            _ => None,
        }
    }

    /// Поток, в который попадает part-выход этой полосы.
    #[must_use]
    pub const fn stream(self) -> Stream {
        match self {
            Self::Top => Stream::Part1,
            Self::Middle => Stream::Part2,
            Self::Bottom => Stream::Part3,
        }
    }
}

/// Режим прямого прохода backbone.
///
/// `AllParts` добавляет к патчам `[CLS]` и все три part-токена и возвращает
/// четыре эмбеддинга. `Part(i)` добавляет только `[CLS]` и токен полосы `i`
/// и возвращает два эмбеддинга.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSelector {
    /// Полный режим: четыре выхода.
    AllParts,
    /// Режим одной части: `[CLS]` и выбранная часть.
    Part(PartIndex),
}

impl PartSelector {
    /// Сколько служебных токенов добавляется перед патчами.
    #[must_use]
    pub const fn prefix_len(self) -> usize {
        match self {
            Self::AllParts => 1 + NUM_PARTS,
            Self::Part(_) => 2,
        }
    }
}
