// Grid construction and re-leveling

use crate::config::GridConfig;
use crate::core::types::{FillNotice, GridLevel, GridPlan, Side, SpacingMode};
use crate::error::{GridBotError, GridBotResult};
use std::collections::BTreeMap;
use tracing::{debug, info};

const STEP_EPSILON: f64 = 1e-9;

/// Upper limit on ladder size.
pub const MAX_RUNGS: usize = 1_000;

/// Pure price-ladder computation. Holds no state besides its configuration.
#[derive(Debug, Clone)]
pub struct GridPlanner {
    config: GridConfig,
}

impl GridPlanner {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Build the first grid generation around `reference_price`.
    pub fn plan(&self, reference_price: f64) -> GridBotResult<GridPlan> {
        self.build(reference_price, 0, 0)
    }

    /// Build a fresh generation after an explicit re-plan request.
    pub fn replan(&self, reference_price: f64, previous: &GridPlan) -> GridBotResult<GridPlan> {
        self.build(reference_price, previous.epoch + 1, previous.generation + 1)
    }

    fn build(&self, reference_price: f64, epoch: u32, generation: u64) -> GridBotResult<GridPlan> {
        let cfg = &self.config;

        if !reference_price.is_finite() || reference_price <= 0.0 {
            return Err(GridBotError::InvalidGridConfig(format!(
                "reference price must be positive, got {}",
                reference_price
            )));
        }
        if !cfg.capital.is_finite() || cfg.capital <= 0.0 {
            return Err(GridBotError::InvalidGridConfig(
                "capital must be positive".to_string(),
            ));
        }

        let rungs = self.rungs()?;
        let per_level_capital = cfg.capital / rungs.len() as f64;

        let idle = rungs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - reference_price)
                    .abs()
                    .total_cmp(&(*b - reference_price).abs())
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let mut levels = BTreeMap::new();
        for (index, &price) in rungs.iter().enumerate() {
            let quantity = self.round_quantity(per_level_capital / price);
            if quantity < cfg.min_order_size || quantity <= 0.0 {
                return Err(GridBotError::InvalidGridConfig(format!(
                    "quantity {:.8} at price {:.4} is below the minimum order size {}",
                    quantity, price, cfg.min_order_size
                )));
            }
            if index == idle {
                continue;
            }
            let side = if index < idle { Side::Buy } else { Side::Sell };
            levels.insert(index, GridLevel { index, price, side, quantity });
        }

        let plan = GridPlan {
            epoch,
            generation,
            lower_bound: cfg.lower_bound,
            upper_bound: cfg.upper_bound,
            spacing_mode: cfg.spacing_mode,
            rungs,
            levels,
            deferred: BTreeMap::new(),
        };

        info!(
            epoch,
            generation,
            rungs = plan.rungs.len(),
            idle_rung = idle,
            reference_price,
            "🎯 Grid planned: {:.4} - {:.4} ({:?}), {:.2} quote per level",
            plan.lower_bound,
            plan.upper_bound,
            plan.spacing_mode,
            per_level_capital
        );

        Ok(plan)
    }

    /// The ordered rung prices for the configured bounds.
    pub fn rungs(&self) -> GridBotResult<Vec<f64>> {
        let cfg = &self.config;
        let (lower, upper) = (cfg.lower_bound, cfg.upper_bound);

        if !lower.is_finite() || !upper.is_finite() || lower <= 0.0 || upper <= 0.0 {
            return Err(GridBotError::InvalidGridConfig(
                "bounds must be positive".to_string(),
            ));
        }
        if lower >= upper {
            return Err(GridBotError::InvalidGridConfig(format!(
                "lower bound {} must be below upper bound {}",
                lower, upper
            )));
        }

        let rungs: Vec<f64> = match cfg.fixed_spacing {
            Some(step) => {
                if !step.is_finite() || step <= 0.0 {
                    return Err(GridBotError::InvalidGridConfig(
                        "fixed spacing must be positive".to_string(),
                    ));
                }
                match cfg.spacing_mode {
                    SpacingMode::Arithmetic => {
                        let n = self.derived_rung_count((upper - lower) / step)?;
                        (0..n).map(|i| lower + i as f64 * step).collect()
                    }
                    SpacingMode::Geometric => {
                        let ratio = 1.0 + step / 100.0;
                        let n = self.derived_rung_count((upper / lower).ln() / ratio.ln())?;
                        (0..n).map(|i| lower * ratio.powi(i as i32)).collect()
                    }
                }
            }
            None => {
                let n = cfg.level_count;
                if n < 2 {
                    return Err(GridBotError::InvalidGridConfig(format!(
                        "level count must be at least 2, got {}",
                        n
                    )));
                }
                self.check_rung_count(n as f64)?;
                let last = (n - 1) as f64;
                let mut rungs: Vec<f64> = match cfg.spacing_mode {
                    SpacingMode::Arithmetic => {
                        let step = (upper - lower) / last;
                        (0..n).map(|i| lower + i as f64 * step).collect()
                    }
                    SpacingMode::Geometric => {
                        let ratio = (upper / lower).powf(1.0 / last);
                        (0..n).map(|i| lower * ratio.powi(i as i32)).collect()
                    }
                };
                // Pin the top rung to the configured bound
                rungs[n - 1] = upper;
                rungs
            }
        };

        if rungs.len() < 2 {
            return Err(GridBotError::InvalidGridConfig(format!(
                "spacing leaves {} level(s) between the bounds; at least 2 are required",
                rungs.len()
            )));
        }

        Ok(rungs)
    }

    /// Rung count for a fixed step, where `steps` is the span measured in
    /// steps. Checked in floating point before anything is allocated.
    fn derived_rung_count(&self, steps: f64) -> GridBotResult<usize> {
        let n = (steps + STEP_EPSILON).floor() + 1.0;
        self.check_rung_count(n)?;
        Ok(n as usize)
    }

    fn check_rung_count(&self, n: f64) -> GridBotResult<()> {
        let cfg = &self.config;
        if !n.is_finite() || n > MAX_RUNGS as f64 {
            return Err(GridBotError::InvalidGridConfig(format!(
                "spacing yields {} rungs; at most {} are supported",
                n, MAX_RUNGS
            )));
        }
        // The top rung buys the least base for its share of capital
        let smallest = cfg.capital / n / cfg.upper_bound;
        if smallest < cfg.min_order_size {
            return Err(GridBotError::InvalidGridConfig(format!(
                "{} rungs leave {:.8} per level at {:.4}, below the minimum order size {}",
                n, smallest, cfg.upper_bound, cfg.min_order_size
            )));
        }
        Ok(())
    }

    fn round_quantity(&self, raw: f64) -> f64 {
        match self.config.quantity_step {
            Some(step) if step > 0.0 => (raw / step + STEP_EPSILON).floor() * step,
            _ => raw,
        }
    }

    /// Re-level after a completed order.
    ///
    /// Returns `None` when the fill does not own a level of this plan (for
    /// example a late fill of an order from an earlier epoch).
    pub fn relevel(&self, plan: &GridPlan, fill: &FillNotice) -> Option<GridPlan> {
        if fill.epoch != plan.epoch {
            debug!(
                order = %fill.client_order_id,
                fill_epoch = fill.epoch,
                plan_epoch = plan.epoch,
                "fill from an earlier epoch does not re-level"
            );
            return None;
        }
        match plan.levels.get(&fill.level_index) {
            Some(level) if level.side == fill.side => {}
            _ => return None,
        }

        let mut next = plan.clone();
        next.generation += 1;
        next.levels.remove(&fill.level_index);

        let target = match fill.side {
            Side::Buy => Some(fill.level_index + 1).filter(|&i| i < plan.rungs.len()),
            Side::Sell => fill.level_index.checked_sub(1),
        };

        if let Some(index) = target {
            let replacement = GridLevel {
                index,
                price: plan.rungs[index],
                side: fill.side.opposite(),
                quantity: fill.quantity,
            };
            if next.levels.contains_key(&index) {
                // Rung still occupied; arm once its own order completes
                debug!(rung = index, side = %replacement.side, "replacement level deferred");
                next.deferred.entry(index).or_default().push(replacement);
            } else {
                debug!(rung = index, side = %replacement.side, price = replacement.price, "replacement level armed");
                next.levels.insert(index, replacement);
            }
        }

        // The filled rung is free now
        if let Some(queue) = next.deferred.get_mut(&fill.level_index) {
            if !queue.is_empty() {
                let released = queue.remove(0);
                next.levels.insert(fill.level_index, released);
            }
            if queue.is_empty() {
                next.deferred.remove(&fill.level_index);
            }
        }

        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> GridConfig {
        GridConfig {
            pair: "BTC/USDT".to_string(),
            lower_bound: 90.0,
            upper_bound: 110.0,
            level_count: 5,
            spacing_mode: SpacingMode::Arithmetic,
            fixed_spacing: None,
            capital: 500.0,
            min_order_size: 0.001,
            quantity_step: None,
            leverage: 1.0,
        }
    }

    fn fill_at(plan: &GridPlan, index: usize) -> FillNotice {
        let level = plan.level(index).unwrap();
        FillNotice {
            client_order_id: format!("order-{}", index),
            level_index: index,
            epoch: plan.epoch,
            side: level.side,
            price: level.price,
            quantity: level.quantity,
        }
    }

    #[test]
    fn test_arithmetic_rungs_and_sides() {
        let planner = GridPlanner::new(create_test_config());
        let plan = planner.plan(100.0).unwrap();

        assert_eq!(plan.rungs, vec![90.0, 95.0, 100.0, 105.0, 110.0]);
        assert_eq!(plan.level(0).unwrap().side, Side::Buy);
        assert_eq!(plan.level(1).unwrap().side, Side::Buy);
        assert!(plan.level(2).is_none(), "rung nearest the price stays idle");
        assert_eq!(plan.level(3).unwrap().side, Side::Sell);
        assert_eq!(plan.level(4).unwrap().side, Side::Sell);

        for level in plan.armed_levels() {
            assert!((level.quantity * level.price - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_geometric_rungs() {
        let mut config = create_test_config();
        config.spacing_mode = SpacingMode::Geometric;
        config.lower_bound = 100.0;
        config.upper_bound = 400.0;
        config.level_count = 3;
        let plan = GridPlanner::new(config).plan(200.0).unwrap();

        assert!((plan.rungs[1] - 200.0).abs() < 1e-9);
        assert_eq!(plan.rungs[2], 400.0);
    }

    #[test]
    fn test_fixed_spacing_derives_level_count() {
        let mut config = create_test_config();
        config.fixed_spacing = Some(2.5);
        let rungs = GridPlanner::new(config).rungs().unwrap();
        assert_eq!(rungs.len(), 9);
        assert_eq!(rungs[8], 110.0);
    }

    #[test]
    fn test_quantity_step_rounds_down() {
        let mut config = create_test_config();
        config.quantity_step = Some(0.01);
        let plan = GridPlanner::new(config).plan(100.0).unwrap();
        // 100 / 95 = 1.0526.. -> 1.05
        assert!((plan.level(1).unwrap().quantity - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_configs() {
        let mut inverted = create_test_config();
        inverted.lower_bound = 120.0;
        assert!(matches!(
            GridPlanner::new(inverted).plan(100.0),
            Err(GridBotError::InvalidGridConfig(_))
        ));

        let mut single = create_test_config();
        single.level_count = 1;
        assert!(GridPlanner::new(single).plan(100.0).is_err());

        let mut broke = create_test_config();
        broke.capital = 0.0;
        assert!(GridPlanner::new(broke).plan(100.0).is_err());

        let mut tiny = create_test_config();
        tiny.min_order_size = 5.0;
        assert!(GridPlanner::new(tiny).plan(100.0).is_err());
    }

    #[test]
    fn test_tiny_fixed_spacing_is_refused() {
        for mode in [SpacingMode::Arithmetic, SpacingMode::Geometric] {
            for step in [1e-300, 1e-12, 1e-3] {
                let mut config = create_test_config();
                config.spacing_mode = mode;
                config.fixed_spacing = Some(step);
                let planner = GridPlanner::new(config);
                assert!(matches!(planner.rungs(), Err(GridBotError::InvalidGridConfig(_))));
                assert!(matches!(planner.plan(100.0), Err(GridBotError::InvalidGridConfig(_))));
            }
        }
    }

    #[test]
    fn test_rung_cap_without_min_order_size() {
        let mut config = create_test_config();
        config.min_order_size = 0.0;
        config.fixed_spacing = Some(0.01);
        assert!(GridPlanner::new(config.clone()).rungs().is_err());

        config.fixed_spacing = None;
        config.level_count = MAX_RUNGS + 1;
        assert!(GridPlanner::new(config.clone()).rungs().is_err());

        config.level_count = MAX_RUNGS;
        assert_eq!(GridPlanner::new(config).rungs().unwrap().len(), MAX_RUNGS);
    }

    #[test]
    fn test_rungs_refuse_degenerate_bounds() {
        let mut flat = create_test_config();
        flat.upper_bound = flat.lower_bound;
        assert!(GridPlanner::new(flat).rungs().is_err());

        let mut inverted = create_test_config();
        inverted.lower_bound = 120.0;
        assert!(GridPlanner::new(inverted).rungs().is_err());

        let mut negative = create_test_config();
        negative.lower_bound = -5.0;
        assert!(GridPlanner::new(negative).rungs().is_err());
    }

    #[test]
    fn test_buy_fill_arms_sell_one_rung_up() {
        let planner = GridPlanner::new(create_test_config());
        let plan = planner.plan(100.0).unwrap();
        let next = planner.relevel(&plan, &fill_at(&plan, 1)).unwrap();

        assert_eq!(next.generation, plan.generation + 1);
        assert!(next.level(1).is_none());
        let replacement = next.level(2).unwrap();
        assert_eq!(replacement.side, Side::Sell);
        assert_eq!(replacement.price, 100.0);
        assert_eq!(replacement.quantity, plan.level(1).unwrap().quantity);
        assert_eq!(next.level(0), plan.level(0));
        assert_eq!(next.level(3), plan.level(3));
    }

    #[test]
    fn test_top_sell_fill_only_disarms() {
        let planner = GridPlanner::new(create_test_config());
        let plan = planner.plan(100.0).unwrap();
        // Sell at rung 4 re-arms a buy at rung 3, which is still a sell level
        let next = planner.relevel(&plan, &fill_at(&plan, 4)).unwrap();
        assert!(next.level(4).is_none());
        assert_eq!(next.level(3).unwrap().side, Side::Sell);
        assert_eq!(next.deferred.get(&3).map(|q| q.len()), Some(1));

        // Once rung 3 fills, the deferred buy takes its place
        let after = planner.relevel(&next, &fill_at(&next, 3)).unwrap();
        assert_eq!(after.level(3).unwrap().side, Side::Buy);
        assert_eq!(after.level(2).unwrap().side, Side::Buy);
        assert!(after.deferred.is_empty());
    }

    #[test]
    fn test_fill_outside_grid_disarms() {
        let planner = GridPlanner::new(create_test_config());
        let plan = planner.plan(111.0).unwrap();
        // All rungs below the idle top rung are buys
        assert!(plan.level(4).is_none());
        let mut next = planner.relevel(&plan, &fill_at(&plan, 0)).unwrap();
        assert!(next.level(0).is_none());
        assert!(next.deferred.contains_key(&1));

        next.levels.clear();
        next.deferred.clear();
        next.levels.insert(0, GridLevel { index: 0, price: 90.0, side: Side::Sell, quantity: 1.0 });
        let last = planner.relevel(&next, &fill_at(&next, 0)).unwrap();
        assert!(last.levels.is_empty());
    }

    #[test]
    fn test_replan_bumps_epoch_and_generation() {
        let planner = GridPlanner::new(create_test_config());
        let plan = planner.plan(100.0).unwrap();
        let fresh = planner.replan(104.0, &plan).unwrap();
        assert_eq!(fresh.generation, plan.generation + 1);
        assert_eq!(fresh.epoch, plan.epoch + 1);
        assert!(fresh.level(3).is_none());

        let stale = fill_at(&plan, 1);
        assert!(planner.relevel(&fresh, &stale).is_none());
    }
}
