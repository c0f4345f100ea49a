//! Call-graph linearization.
//!
//! Collects the helper methods reachable from the entry point, in the
//! order they are first reached (depth-first, callees in source order),
//! each exactly once. Kernel dialects have no call stack guarantee, so
//! any cycle among reachable methods is a compile error.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::diagnostic::{CompileError, ErrorKind};
use crate::ir::{for_each_stmt, own_exprs, walk_expr, Expr, Method};

/// A call site: callee name and the statement ordinal holding the call.
struct CallSite {
    callee: String,
    position: usize,
}

fn call_sites(method: &Method) -> Vec<CallSite> {
    let mut sites = Vec::new();
    for_each_stmt(&method.body, &mut |position, stmt| {
        for expr in own_exprs(stmt) {
            walk_expr(expr, &mut |e| {
                if let Expr::Call { method, .. } = e {
                    sites.push(CallSite {
                        callee: method.clone(),
                        position,
                    });
                }
            });
        }
    });
    sites
}

/// Reachable methods in first-reached order; `result[0]` is the entry.
pub fn linearize<'m>(
    kernel: &str,
    methods: &'m [Method],
    entry: &str,
) -> Result<Vec<&'m Method>, CompileError> {
    let by_name: HashMap<&str, usize> = methods
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();
    let entry_idx = *by_name.get(entry).ok_or_else(|| {
        CompileError::new(
            ErrorKind::InvalidDescriptor,
            kernel,
            format!("entry point '{}' is not declared", entry),
        )
    })?;

    // Resolve every call site of every method up front.
    let mut callees: Vec<Vec<(usize, usize)>> = Vec::with_capacity(methods.len());
    for method in methods {
        let mut resolved = Vec::new();
        for site in call_sites(method) {
            let Some(&target) = by_name.get(site.callee.as_str()) else {
                return Err(CompileError::new(
                    ErrorKind::UnknownSymbol,
                    kernel,
                    format!("call to undeclared method '{}'", site.callee),
                )
                .in_method(&method.name)
                .at(site.position));
            };
            resolved.push((target, site.position));
        }
        callees.push(resolved);
    }

    let mut order = Vec::new();
    let mut seen = vec![false; methods.len()];
    visit(entry_idx, &callees, &mut seen, &mut order);

    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: HashMap<usize, NodeIndex> = order.iter().map(|&m| (m, graph.add_node(m))).collect();
    for &m in &order {
        for &(callee, _) in &callees[m] {
            if !graph.contains_edge(nodes[&m], nodes[&callee]) {
                graph.add_edge(nodes[&m], nodes[&callee], ());
            }
        }
    }

    for scc in tarjan_scc(&graph) {
        let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
        if scc.len() < 2 && !self_loop {
            continue;
        }
        let mut members: Vec<usize> = scc.iter().map(|n| graph[*n]).collect();
        members.sort_by_key(|m| order.iter().position(|o| o == m));
        let first = members[0];
        let position = callees[first]
            .iter()
            .find(|(callee, _)| members.contains(callee))
            .map(|(_, pos)| *pos);
        let names: Vec<&str> = members.iter().map(|&m| methods[m].name.as_str()).collect();
        let message = if self_loop {
            format!("method '{}' calls itself", names[0])
        } else {
            format!("methods {} call each other recursively", names.join(" -> "))
        };
        let mut err = CompileError::new(ErrorKind::Recursion, kernel, message)
            .in_method(&methods[first].name)
            .with_help("kernels have no call stack; rewrite the recursion as a loop".to_string());
        if let Some(p) = position {
            err = err.at(p);
        }
        return Err(err);
    }

    Ok(order.into_iter().map(|m| &methods[m]).collect())
}

fn visit(m: usize, callees: &[Vec<(usize, usize)>], seen: &mut [bool], order: &mut Vec<usize>) {
    if seen[m] {
        return;
    }
    seen[m] = true;
    order.push(m);
    for &(callee, _) in &callees[m] {
        visit(callee, callees, seen, order);
    }
}
