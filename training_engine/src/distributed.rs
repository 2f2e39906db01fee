// training_engine/src/distributed.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Коллективные операции между процессами обучения и контекст запуска.
//!
//! Все участники группы вызывают операции в одном и том же порядке
//! (обучение идет в lock-step). Транспорт скрыт за трейтом [`Collective`];
//! в крейте есть реализация для одного процесса и группа потоков внутри
//! процесса.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use tracing::debug;

use crate::CollectiveError;

/// Контракт коллективных операций.
pub trait Collective: Send + Sync {
    /// Ранг текущего участника.
    fn rank(&self) -> usize;

    /// Число участников.
    fn world_size(&self) -> usize;

    /// Поэлементная сумма буферов всех участников; результат получает каждый.
    ///
    /// # Ошибки
    /// `CollectiveError` при несовпадении длин или повреждении общего состояния.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), CollectiveError>;

    /// Копирует буфер участника `root` всем остальным.
    ///
    /// # Ошибки
    /// `CollectiveError` при неверном `root` или несовпадении длин.
    fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<(), CollectiveError>;

    /// Ждет всех участников.
    ///
    /// # Ошибки
    /// `CollectiveError` при повреждении общего состояния.
    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Главный ли это процесс (ранг 0).
    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// Единственный участник: все операции тривиальны.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        if root != 0 {
            return Err(CollectiveError::InvalidRoot { root, world_size: 1 });
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }
}

#[derive(Debug)]
struct GroupShared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// Участник группы потоков одного процесса.
///
/// Каждый участник пишет только в свой слот общего буфера; между записью и
/// чтением и между чтением и следующей записью стоят барьеры. Сумма берется в
/// порядке рангов, поэтому все участники получают побитово одинаковый
/// результат.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Создает группу из `world_size` участников; элемент `i` имеет ранг `i`.
    #[must_use]
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        debug!("Создана группа потоков из {} участников", world_size);
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Vec<f32>>>, CollectiveError> {
        self.shared
            .slots
            .lock()
            .map_err(|e| CollectiveError::Poisoned(e.to_string()))
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), CollectiveError> {
        // Барьеры проходятся при любой ошибке, иначе остальные участники зависнут.
        let written = self.slots().map(|mut slots| {
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(buffer);
        });
        self.shared.barrier.wait();

        let result = written.and_then(|()| {
            let slots = self.slots()?;
            match slots.iter().find(|slot| slot.len() != buffer.len()) {
                Some(slot) => Err(CollectiveError::LengthMismatch {
                    expected: buffer.len(),
                    actual: slot.len(),
                }),
                None => {
                    for (i, value) in buffer.iter_mut().enumerate() {
                        *value = slots.iter().map(|slot| slot[i]).sum();
                    }
                    Ok(())
                }
            }
        });
        self.shared.barrier.wait();
        result
    }

    fn broadcast(&self, buffer: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        if root >= self.world_size {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }
        let written = if self.rank == root {
            self.slots().map(|mut slots| {
                slots[root].clear();
                slots[root].extend_from_slice(buffer);
            })
        } else {
            Ok(())
        };
        self.shared.barrier.wait();

        let result = written.and_then(|()| {
            if self.rank == root {
                return Ok(());
            }
            let slots = self.slots()?;
            if slots[root].len() == buffer.len() {
                buffer.copy_from_slice(&slots[root]);
                Ok(())
            } else {
                Err(CollectiveError::LengthMismatch {
                    expected: buffer.len(),
                    actual: slots[root].len(),
                })
            }
        });
        self.shared.barrier.wait();
        result
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        self.shared.barrier.wait();
        Ok(())
    }
}

/// Контекст запуска: ранг, размер группы, базовое зерно и коллективные операции.
///
/// Передается явно в инициализацию, загрузку данных и цикл обучения.
#[derive(Clone)]
pub struct RunContext {
    /// Ранг текущего участника.
    pub rank: usize,
    /// Число участников.
    pub world_size: usize,
    /// Базовое зерно случайности (каждый ранг смещает его на свой номер).
    pub seed: u64,
    /// Коллективные операции.
    pub collective: Arc<dyn Collective>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Контекст для заданной группы.
    #[must_use]
    pub fn new(collective: Arc<dyn Collective>, seed: u64) -> Self {
        Self {
            rank: collective.rank(),
            world_size: collective.world_size(),
            seed,
            collective,
        }
    }

    /// Контекст одного процесса.
    #[must_use]
    pub fn single(seed: u64) -> Self {
        Self::new(Arc::new(SingleProcess), seed)
    }

    /// Главный ли это процесс.
    #[must_use]
    pub const fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Зерно текущего ранга.
    #[must_use]
    pub const fn rank_seed(&self) -> u64 {
        self.seed.wrapping_add(self.rank as u64)
    }

    /// Среднее буфера по всем участникам.
    ///
    /// # Ошибки
    /// См. [`Collective::all_reduce_sum`].
    #[allow(clippy::cast_precision_loss)]
    pub fn all_reduce_mean(&self, buffer: &mut [f32]) -> Result<(), CollectiveError> {
        if self.world_size == 1 {
            return Ok(());
        }
        self.collective.all_reduce_sum(buffer)?;
        let scale = 1.0 / self.world_size as f32;
        buffer.iter_mut().for_each(|value| *value *= scale);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::thread;

    fn poison(group: &ThreadGroup) {
        let shared = Arc::clone(&group.shared);
        let _ = thread::spawn(move || {
            let _guard = shared.slots.lock().unwrap();
            panic!("участник упал с захваченным буфером");
        })
        .join();
        assert!(group.shared.slots.is_poisoned());
    }

    #[test]
    fn poisoned_group_fails_without_deadlock() {
        let group = ThreadGroup::new(2);
        poison(&group[0]);
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let mut buffer = vec![1.0_f32; 3];
                    let reduced = member.all_reduce_sum(&mut buffer);
                    let broadcast = member.broadcast(&mut buffer, 0);
                    (reduced, broadcast)
                })
            })
            .collect();
        for handle in handles {
            let (reduced, broadcast) = handle.join().unwrap();
            assert!(matches!(reduced, Err(CollectiveError::Poisoned(_))));
            assert!(matches!(broadcast, Err(CollectiveError::Poisoned(_))));
        }
    }
}
