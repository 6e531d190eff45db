//! Tree reconstruction from flat instance reports
//!
//! Reports arrive in arbitrary order. [`build`] indexes them into an arena,
//! validates the parent links, orders them so that every child comes before
//! its parent, and hands each report to a factory together with its already
//! built children. Any failure aborts the whole build and drops whatever was
//! built so far.

use hwl_protocol::InstanceReport;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::BuildError;

/// Validated arena of reports and their bottom-up build order
#[derive(Debug)]
pub struct BuildPlan<'a> {
    reports: &'a [InstanceReport],
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
    root: usize,
}

impl<'a> BuildPlan<'a> {
    /// Validate `reports` and compute a build order
    pub fn new(reports: &'a [InstanceReport]) -> Result<Self, BuildError> {
        if reports.is_empty() {
            return Err(BuildError::NoReports);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(reports.len());
        for (i, report) in reports.iter().enumerate() {
            if index.insert(report.uuid.as_str(), i).is_some() {
                return Err(BuildError::DuplicateId(report.uuid.clone()));
            }
        }

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); reports.len()];
        let mut roots = Vec::new();
        for (i, report) in reports.iter().enumerate() {
            match report.parent() {
                None => roots.push(i),
                Some(parent) => {
                    let p = *index.get(parent).ok_or_else(|| BuildError::UnresolvedParent {
                        uuid: report.uuid.clone(),
                        parent: parent.to_string(),
                    })?;
                    children[p].push(i);
                }
            }
        }

        for (p, kids) in children.iter().enumerate() {
            let mut seen = std::collections::HashSet::with_capacity(kids.len());
            for &c in kids {
                let name = reports[c]
                    .name()
                    .ok_or_else(|| BuildError::MissingName(reports[c].uuid.clone()))?;
                if !seen.insert(name) {
                    return Err(BuildError::DuplicateName {
                        parent: reports[p].uuid.clone(),
                        name: name.to_string(),
                    });
                }
            }
        }

        // Kahn's algorithm over child -> parent edges: a node is ready once
        // all of its children are built.
        let mut pending: Vec<usize> = children.iter().map(Vec::len).collect();
        let mut parent_of: Vec<Option<usize>> = vec![None; reports.len()];
        for (p, kids) in children.iter().enumerate() {
            for &c in kids {
                parent_of[c] = Some(p);
            }
        }

        let mut ready: VecDeque<usize> = (0..reports.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(reports.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            if let Some(p) = parent_of[i] {
                pending[p] -= 1;
                if pending[p] == 0 {
                    ready.push_back(p);
                }
            }
        }

        if order.len() < reports.len() {
            let mut stuck: Vec<String> = (0..reports.len())
                .filter(|&i| pending[i] > 0)
                .map(|i| reports[i].uuid.clone())
                .collect();
            stuck.sort();
            return Err(BuildError::Cycle(stuck));
        }

        match roots.as_slice() {
            [root] => Ok(Self {
                reports,
                children,
                order,
                root: *root,
            }),
            _ => {
                let mut ids: Vec<String> = roots.iter().map(|&i| reports[i].uuid.clone()).collect();
                ids.sort();
                Err(BuildError::MultipleRoots(ids))
            }
        }
    }

    /// Reports in build order, children before parents
    pub fn ordered(&self) -> impl Iterator<Item = &'a InstanceReport> + '_ {
        self.order.iter().map(|&i| &self.reports[i])
    }

    /// The single parentless report
    pub fn root(&self) -> &'a InstanceReport {
        &self.reports[self.root]
    }

    /// Run `factory` over every report in build order and return the root
    pub fn build<N, E, F>(&self, mut factory: F) -> Result<N, E>
    where
        F: FnMut(&InstanceReport, BTreeMap<String, N>) -> Result<N, E>,
        E: From<BuildError>,
    {
        let mut built: Vec<Option<N>> = Vec::with_capacity(self.reports.len());
        built.resize_with(self.reports.len(), || None);

        for &i in &self.order {
            let mut kids = BTreeMap::new();
            for &c in &self.children[i] {
                // Names were validated when the plan was made
                if let (Some(name), Some(node)) = (self.reports[c].name(), built[c].take()) {
                    kids.insert(name.to_string(), node);
                }
            }
            built[i] = Some(factory(&self.reports[i], kids)?);
        }

        built[self.root]
            .take()
            .ok_or_else(|| BuildError::NoReports.into())
    }
}

/// Build a tree from `reports`, returning the root node
///
/// `factory` is called once per report, children strictly before parents,
/// and receives the finished children keyed by their name label.
pub fn build<N, E, F>(reports: &[InstanceReport], factory: F) -> Result<N, E>
where
    F: FnMut(&InstanceReport, BTreeMap<String, N>) -> Result<N, E>,
    E: From<BuildError>,
{
    let plan = BuildPlan::new(reports)?;
    plan.build(factory)
}
