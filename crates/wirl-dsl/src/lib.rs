//! WIRL language front end: lexer, parser, AST, and graph compiler.
//!
//! ```text
//! source text -> [lexer] -> tokens -> [parser] -> AST -> [compiler] -> Workflow
//! ```
//!
//! This crate has no knowledge of execution or persistence; it only turns
//! WIRL source into a validated, immutable `Workflow` graph.

pub mod ast;
pub mod compiler;
pub mod error;
pub mod graph;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::WorkflowAst;
pub use error::{CompileError, ParseError};
pub use graph::Workflow;

/// Parses WIRL source into an AST.
pub fn parse(source: &str) -> Result<WorkflowAst, ParseError> {
    parser::Parser::new(source)?.parse_workflow()
}

/// Parses and compiles WIRL source into an executable `Workflow` graph in
/// one step.
pub fn compile(source: &str) -> Result<Workflow, Vec<CompileError>> {
    let ast = parse(source).map_err(|e| vec![CompileError::from(e)])?;
    compiler::compile(&ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR_SUM: &str = r#"
        workflow LinearSum {
            inputs { int x; }
            outputs { y = B.out; }

            node A {
                call "math.increment";
                inputs { int x = x; }
                outputs { int out; }
            }

            node B {
                call "math.double";
                inputs { int x = A.out; }
                outputs { int out; }
            }
        }
    "#;

    #[test]
    fn compiles_linear_sum_example() {
        let workflow = compile(LINEAR_SUM).expect("should compile");
        assert_eq!(workflow.name, "LinearSum");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.topo_order, vec![0, 1]);
    }

    #[test]
    fn rejects_dead_start_graph() {
        let source = r#"
            workflow Dead {
                inputs { int x; }
                outputs { y = A.out; }
                node A {
                    call "math.identity";
                    inputs { int v = 1; }
                    outputs { int out; }
                }
            }
        "#;
        let errs = compile(source).expect_err("must reject dead-start graph");
        assert!(errs.iter().any(|e| matches!(e, CompileError::DeadStart)));
    }
}
