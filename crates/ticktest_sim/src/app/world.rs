/// Ticks a furnace needs to turn one ore into one plate.
pub(crate) const SMELT_TICKS: u32 = 4;

/// The simulated game: a single furnace. Owned by the host, so it outlives
/// framework reloads the way a save does.
#[derive(Debug, Default)]
pub(crate) struct World {
    ore: u32,
    plates: u32,
    progress: u32,
    reloads: u32,
}

impl World {
    pub(crate) fn step(&mut self) {
        if self.ore == 0 {
            self.progress = 0;
            return;
        }
        self.progress += 1;
        if self.progress >= SMELT_TICKS {
            self.progress = 0;
            self.ore -= 1;
            self.plates += 1;
        }
    }

    pub(crate) fn insert_ore(&mut self, amount: u32) {
        self.ore += amount;
    }

    pub(crate) fn ore(&self) -> u32 {
        self.ore
    }

    pub(crate) fn plates(&self) -> u32 {
        self.plates
    }

    /// Empties the furnace. The reload count is kept.
    pub(crate) fn reset(&mut self) {
        self.ore = 0;
        self.plates = 0;
        self.progress = 0;
    }

    pub(crate) fn note_reload(&mut self) {
        self.reloads += 1;
    }

    pub(crate) fn reloads(&self) -> u32 {
        self.reloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_plate_per_batch_of_ticks() {
        let mut world = World::default();
        world.insert_ore(2);
        for _ in 0..SMELT_TICKS - 1 {
            world.step();
        }
        assert_eq!(world.plates(), 0);
        world.step();
        assert_eq!((world.ore(), world.plates()), (1, 1));
    }

    #[test]
    fn empty_furnace_loses_progress() {
        let mut world = World::default();
        world.step();
        world.insert_ore(1);
        world.step();
        world.reset();
        world.insert_ore(1);
        for _ in 0..SMELT_TICKS {
            world.step();
        }
        assert_eq!(world.plates(), 1);
    }
}
