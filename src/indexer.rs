use std::collections::BTreeSet;

use rand::{Rng, RngCore};

use crate::{
    error::Result,
    node::NodeId,
    scaffold::{PrincipalProposal, Scaffold},
    trace::{Trace, DEFAULT_SCOPE},
    value::Value,
};

/// Which blocks of a scope a transition acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelector {
    /// One block drawn uniformly from the scope.
    One,
    /// The union of every block of the scope.
    All,
    /// Every block of the scope, taken in block order. The principal
    /// nodes are those of `All`; `ordered_blocks` gives the sequence.
    Ordered,
    Named(Value),
}

/// Selects the principal nodes of a transition by scope and block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldIndexer {
    pub scope: Value,
    pub block: BlockSelector,
}

impl Default for ScaffoldIndexer {
    /// One random choice of the whole trace at a time.
    fn default() -> Self {
        ScaffoldIndexer {
            scope: Value::symbol(DEFAULT_SCOPE),
            block: BlockSelector::One,
        }
    }
}

impl ScaffoldIndexer {
    pub fn new(scope: Value, block: BlockSelector) -> ScaffoldIndexer {
        ScaffoldIndexer { scope, block }
    }

    /// Choose the principal nodes and build their scaffold. An empty scope
    /// or block gives an empty scaffold.
    pub fn sample_index(
        &self,
        trace: &Trace,
        proposal: PrincipalProposal,
        rng: &mut dyn RngCore,
    ) -> Result<Scaffold> {
        let principal = match &self.block {
            BlockSelector::One => {
                let blocks = trace.blocks(&self.scope);
                if blocks.is_empty() {
                    BTreeSet::new()
                } else {
                    let block = &blocks[rng.random_range(0..blocks.len())];
                    trace.block_nodes(&self.scope, block)
                }
            }
            BlockSelector::All => trace.scope_nodes(&self.scope),
            BlockSelector::Ordered => self
                .ordered_blocks(trace)
                .into_iter()
                .flatten()
                .collect(),
            BlockSelector::Named(block) => trace.block_nodes(&self.scope, block),
        };
        if principal.is_empty() {
            return Ok(Scaffold::default());
        }
        Scaffold::construct(trace, principal, proposal)
    }

    /// The blocks of the scope in block order, each with its nodes.
    pub fn ordered_blocks(&self, trace: &Trace) -> Vec<BTreeSet<NodeId>> {
        trace
            .blocks(&self.scope)
            .iter()
            .map(|block| trace.block_nodes(&self.scope, block))
            .collect()
    }

    /// Log probability that `sample_index` chose the principal nodes of
    /// `scaffold` in the current state of the trace.
    pub fn log_density_of_index(&self, trace: &Trace, _scaffold: &Scaffold) -> f64 {
        match self.block {
            BlockSelector::One => -(trace.num_blocks(&self.scope) as f64).ln(),
            BlockSelector::All | BlockSelector::Ordered | BlockSelector::Named(_) => 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp::read;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn selectors_pick_principal_nodes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut trace = Trace::new();
        trace.assume("a", &read("(scope_include 'group 0 (normal 0 1))")?, &mut rng)?;
        trace.assume("b", &read("(scope_include 'group 0 (normal 0 1))")?, &mut rng)?;
        trace.assume("c", &read("(scope_include 'group 1 (normal 0 1))")?, &mut rng)?;
        let group = Value::symbol("group");

        let all = ScaffoldIndexer::new(group.clone(), BlockSelector::All);
        let scaffold = all.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert_eq!(scaffold.principal.len(), 3);
        assert_eq!(all.log_density_of_index(&trace, &scaffold), 0.);

        let ordered = ScaffoldIndexer::new(group.clone(), BlockSelector::Ordered);
        let blocks = ordered.ordered_blocks(&trace);
        assert_eq!(blocks.iter().map(BTreeSet::len).collect::<Vec<_>>(), vec![2, 1]);
        let scaffold = ordered.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert_eq!(scaffold.principal.len(), 3);
        assert_eq!(ordered.log_density_of_index(&trace, &scaffold), 0.);

        let named = ScaffoldIndexer::new(group.clone(), BlockSelector::Named(Value::Number(0.)));
        let scaffold = named.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert_eq!(scaffold.principal.len(), 2);

        let one = ScaffoldIndexer::new(group, BlockSelector::One);
        let scaffold = one.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert!(matches!(scaffold.principal.len(), 1 | 2));
        assert_eq!(one.log_density_of_index(&trace, &scaffold), -(2f64.ln()));

        let default = ScaffoldIndexer::default();
        let scaffold = default.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert_eq!(scaffold.principal.len(), 1);
        assert_eq!(default.log_density_of_index(&trace, &scaffold), -(3f64.ln()));
        Ok(())
    }

    #[test]
    fn empty_scope_gives_empty_scaffold() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        let trace = Trace::new();
        let indexer = ScaffoldIndexer::new(Value::symbol("nothing"), BlockSelector::One);
        let scaffold = indexer.sample_index(&trace, PrincipalProposal::Prior, &mut rng)?;
        assert!(scaffold.is_empty());
        Ok(())
    }
}
