use crate::model::{AllocationPolicy, Ms, Sector};

/// Pick a sector for an unbooked entry.
///
/// Only sectors active at `now` with a free place compete. Ties go to the
/// sector met first, so the result is a pure function of the slice.
pub fn choose(policy: AllocationPolicy, sectors: &[Sector], now: Ms) -> Option<&Sector> {
    let mut best: Option<&Sector> = None;
    for candidate in sectors
        .iter()
        .filter(|s| s.is_active_at(now) && s.available_places > 0)
    {
        best = match best {
            Some(current) if !beats(policy, candidate, current) => Some(current),
            _ => Some(candidate),
        };
    }
    best
}

/// Strictly better, never equal.
fn beats(policy: AllocationPolicy, candidate: &Sector, current: &Sector) -> bool {
    match policy {
        AllocationPolicy::LeastOccupied => candidate.occupied() < current.occupied(),
        AllocationPolicy::MostOccupied => candidate.occupied() > current.occupied(),
        // occupied/weight compared by cross-multiplication: exact, no floats.
        AllocationPolicy::LeastOccupiedWeighted => {
            (candidate.occupied() as u64) * (current.weight as u64)
                < (current.occupied() as u64) * (candidate.weight as u64)
        }
    }
}
