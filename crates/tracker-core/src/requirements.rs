//! Aggregate material requirements across active projects.

use crate::{MaterialMap, Project};

/// Sum the requirements of every project, per material.
///
/// Quantities saturate at `u64::MAX` instead of overflowing.
pub fn aggregate_requirements(projects: &[Project]) -> MaterialMap {
    let mut totals = MaterialMap::new();
    for p in projects {
        for (material, qty) in &p.requirements {
            let slot = totals.entry(material.clone()).or_insert(0);
            *slot = slot.saturating_add(*qty);
        }
    }
    totals
}

/// Materials still missing: `needed - owned` for every material where owned < needed.
pub fn shortfall(totals: &MaterialMap, inventory: &MaterialMap) -> MaterialMap {
    totals
        .iter()
        .filter_map(|(m, &need)| {
            let have = inventory.get(m).copied().unwrap_or(0);
            (have < need).then(|| (m.clone(), need - have))
        })
        .collect()
}

/// Overall completion in percent, counting each unit of need once.
///
/// Surplus of one material never compensates for another. Returns 100 when
/// nothing is required.
pub fn completion_percent(totals: &MaterialMap, inventory: &MaterialMap) -> f64 {
    let mut need_sum: u128 = 0;
    let mut have_sum: u128 = 0;
    for (m, &need) in totals {
        let have = inventory.get(m).copied().unwrap_or(0);
        need_sum += need as u128;
        have_sum += have.min(need) as u128;
    }
    if need_sum == 0 {
        return 100.0;
    }
    have_sum as f64 / need_sum as f64 * 100.0
}
