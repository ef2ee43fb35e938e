use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    mem,
};

/// Syntax tree of a single expression.
///
/// Trees are immutable once built and own their children, so dropping the
/// root frees the whole tree. Equality and hashing are structural: same
/// shape, operators, literal values and identifiers, with function
/// parameters compared positionally.
///
/// Every traversal here runs on an explicit work list, so trees of any
/// height can be cloned, compared, printed and dropped.
pub enum Node {
    Number(f64),
    Variable(String),
    Operator(Operator, Box<Node>, Box<Node>),
    /// Only `Plus` and `Minus` are meaningful here. The parser never builds
    /// anything else, the backends reject it.
    Unary(Operator, Box<Node>),
    Function(String, Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Exponent,
}

impl Node {
    pub fn number(value: f64) -> Self {
        Node::Number(value)
    }

    pub fn variable(identifier: impl Into<String>) -> Self {
        Node::Variable(identifier.into())
    }

    pub fn operator(operator: Operator, left: Node, right: Node) -> Self {
        Node::Operator(operator, Box::new(left), Box::new(right))
    }

    pub fn unary(operator: Operator, child: Node) -> Self {
        Node::Unary(operator, Box::new(child))
    }

    pub fn function(identifier: impl Into<String>, parameters: Vec<Node>) -> Self {
        Node::Function(identifier.into(), parameters)
    }

    /// Direct children in evaluation order.
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Number(_) | Node::Variable(_) => Vec::new(),
            Node::Operator(_, left, right) => vec![left.as_ref(), right.as_ref()],
            Node::Unary(_, child) => vec![child.as_ref()],
            Node::Function(_, parameters) => parameters.iter().collect(),
        }
    }
}

impl Node {
    fn is_leaf(&self) -> bool {
        matches!(self, Node::Number(_) | Node::Variable(_))
    }

    /// A copy of this node with placeholders in place of its children.
    fn shallow(&self) -> Node {
        match self {
            Node::Number(value) => Node::Number(*value),
            Node::Variable(identifier) => Node::Variable(identifier.clone()),
            Node::Operator(op, _, _) => Node::operator(*op, placeholder(), placeholder()),
            Node::Unary(op, _) => Node::unary(*op, placeholder()),
            Node::Function(identifier, parameters) => Node::Function(
                identifier.clone(),
                parameters.iter().map(|_| placeholder()).collect(),
            ),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Node> {
        match self {
            Node::Number(_) | Node::Variable(_) => Vec::new(),
            Node::Operator(_, left, right) => vec![left.as_mut(), right.as_mut()],
            Node::Unary(_, child) => vec![child.as_mut()],
            Node::Function(_, parameters) => parameters.iter_mut().collect(),
        }
    }

    /// Moves out every child that has children of its own.
    fn detach_children(&mut self) -> Vec<Node> {
        let mut detached = Vec::new();
        match self {
            Node::Number(_) | Node::Variable(_) => {}
            Node::Function(_, parameters) => {
                detached.extend(parameters.drain(..).filter(|parameter| !parameter.is_leaf()));
            }
            _ => {
                for child in self.children_mut() {
                    if !child.is_leaf() {
                        detached.push(mem::replace(child, placeholder()));
                    }
                }
            }
        }
        detached
    }
}

fn placeholder() -> Node {
    Node::Number(0.0)
}

impl Clone for Node {
    fn clone(&self) -> Self {
        let mut root = self.shallow();
        {
            let mut pending = vec![(self, &mut root)];
            while let Some((source, target)) = pending.pop() {
                for (source, target) in source.children().into_iter().zip(target.children_mut())
                {
                    *target = source.shallow();
                    pending.push((source, target));
                }
            }
        }
        root
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = self.detach_children();
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.detach_children());
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some(pair) = pending.pop() {
            let same = match pair {
                // Bitwise, so that equality agrees with `Hash` and stays reflexive
                (Node::Number(a), Node::Number(b)) => a.to_bits() == b.to_bits(),
                (Node::Variable(a), Node::Variable(b)) => a == b,
                (
                    Node::Operator(op_a, left_a, right_a),
                    Node::Operator(op_b, left_b, right_b),
                ) => {
                    pending.push((left_a.as_ref(), left_b.as_ref()));
                    pending.push((right_a.as_ref(), right_b.as_ref()));
                    op_a == op_b
                }
                (Node::Unary(op_a, a), Node::Unary(op_b, b)) => {
                    pending.push((a.as_ref(), b.as_ref()));
                    op_a == op_b
                }
                (Node::Function(name_a, params_a), Node::Function(name_b, params_b)) => {
                    pending.extend(params_a.iter().zip(params_b));
                    name_a == name_b && params_a.len() == params_b.len()
                }
                _ => false,
            };
            if !same {
                return false;
            }
        }
        true
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            mem::discriminant(node).hash(state);
            match node {
                Node::Number(n) => n.to_bits().hash(state),
                Node::Variable(identifier) => identifier.hash(state),
                Node::Operator(op, left, right) => {
                    op.hash(state);
                    pending.push(right);
                    pending.push(left);
                }
                Node::Unary(op, child) => {
                    op.hash(state);
                    pending.push(child);
                }
                Node::Function(identifier, parameters) => {
                    identifier.hash(state);
                    parameters.len().hash(state);
                    pending.extend(parameters.iter().rev());
                }
            }
        }
    }
}

enum Piece<'a> {
    Text(&'static str),
    Tree(&'a Node),
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pending = vec![Piece::Tree(self)];
        while let Some(piece) = pending.pop() {
            match piece {
                Piece::Text(text) => f.write_str(text)?,
                Piece::Tree(Node::Number(n)) => write!(f, "{}", n)?,
                Piece::Tree(Node::Variable(identifier)) => f.write_str(identifier)?,
                Piece::Tree(Node::Operator(op, left, right)) => {
                    write!(f, "({} ", op)?;
                    pending.extend([
                        Piece::Text(")"),
                        Piece::Tree(right),
                        Piece::Text(" "),
                        Piece::Tree(left),
                    ]);
                }
                Piece::Tree(Node::Unary(op, child)) => {
                    write!(f, "({} ", op)?;
                    pending.extend([Piece::Text(")"), Piece::Tree(child)]);
                }
                Piece::Tree(Node::Function(identifier, parameters)) => {
                    write!(f, "{}(", identifier)?;
                    pending.push(Piece::Text(")"));
                    for (i, parameter) in parameters.iter().enumerate().rev() {
                        pending.push(Piece::Tree(parameter));
                        if i > 0 {
                            pending.push(Piece::Text(", "));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::Plus => write!(f, "+"),
            Operator::Minus => write!(f, "-"),
            Operator::Multiply => write!(f, "*"),
            Operator::Divide => write!(f, "/"),
            Operator::Modulo => write!(f, "%"),
            Operator::Exponent => write!(f, "^"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash(node: &Node) -> u64 {
        let mut hasher = DefaultHasher::new();
        node.hash(&mut hasher);
        hasher.finish()
    }

    fn sin_of(divisor: f64) -> Node {
        Node::function(
            "sin",
            vec![Node::operator(
                Operator::Divide,
                Node::variable("pi"),
                Node::number(divisor),
            )],
        )
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(sin_of(2.0), sin_of(2.0));
        assert_eq!(hash(&sin_of(2.0)), hash(&sin_of(2.0)));
        assert_ne!(sin_of(2.0), sin_of(4.0));
        assert_ne!(hash(&sin_of(2.0)), hash(&sin_of(4.0)));
    }

    #[test]
    fn test_unary_plus_is_not_its_child() {
        let child = Node::number(1.0);
        assert_ne!(Node::unary(Operator::Plus, child.clone()), child);
    }

    #[test]
    fn test_parameters_compare_positionally() {
        let a = Node::function("f", vec![Node::variable("x"), Node::variable("y")]);
        let b = Node::function("f", vec![Node::variable("y"), Node::variable("x")]);
        let c = Node::function("f", vec![Node::variable("x")]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_nan_literal_equals_itself() {
        assert_eq!(Node::number(f64::NAN), Node::number(f64::NAN));
    }

    #[test]
    fn test_display() {
        let node = Node::operator(
            Operator::Plus,
            Node::unary(Operator::Minus, Node::number(2.0)),
            Node::function("max", vec![Node::variable("a"), Node::number(0.5)]),
        );
        assert_eq!(node.to_string(), "(+ (- 2) max(a, 0.5))");
    }

    #[test]
    fn test_children_in_order() {
        let node = Node::function("f", vec![Node::number(1.0), Node::number(2.0)]);
        assert_eq!(node.children(), vec![&Node::number(1.0), &Node::number(2.0)]);
        assert!(Node::variable("x").children().is_empty());
    }

    #[test]
    fn test_tall_trees() {
        let mut tree = Node::variable("x");
        for i in 0..200_000 {
            tree = match i % 3 {
                0 => Node::operator(Operator::Plus, tree, Node::number(1.0)),
                1 => Node::unary(Operator::Minus, tree),
                _ => Node::function("f", vec![Node::number(2.0), tree]),
            };
        }

        let copy = tree.clone();
        assert_eq!(copy, tree);
        assert_eq!(hash(&copy), hash(&tree));
        assert!(copy.to_string().starts_with("(- (+ f(2, (- (+ f(2, "));
        assert_ne!(Node::unary(Operator::Plus, copy), tree);
    }
}
