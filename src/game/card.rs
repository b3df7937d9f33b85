//! Card model
//!
//! Kingdoms, items, corners and the two sides of every card. Card content is
//! generated procedurally by [`CardSet::standard`]; the server never loads
//! artwork or card files.

use serde::{Deserialize, Serialize};

/// The four kingdoms. Every resource and gold card belongs to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kingdom {
    Fungi,
    Plant,
    Animal,
    Insect,
}

/// All kingdoms in canonical order.
pub const KINGDOMS: [Kingdom; 4] = [Kingdom::Fungi, Kingdom::Plant, Kingdom::Animal, Kingdom::Insect];

/// Items that can sit in a corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Item {
    Quill,
    Inkwell,
    Manuscript,
}

/// All items in canonical order.
pub const ITEMS: [Item; 3] = [Item::Quill, Item::Inkwell, Item::Manuscript];

/// A visible symbol on a codex: either a kingdom resource or an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Symbol {
    Kingdom(Kingdom),
    Item(Item),
}

impl Symbol {
    /// Stable numeric tag used when hashing.
    pub fn tag(self) -> u8 {
        match self {
            Symbol::Kingdom(k) => k as u8,
            Symbol::Item(i) => 4 + i as u8,
        }
    }
}

/// Content of one corner of a side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Corner {
    /// No corner at all. Nothing may be placed over it.
    Hidden,
    /// A corner with nothing printed on it.
    Empty,
    /// A corner carrying a symbol.
    Symbol(Symbol),
}

impl Corner {
    /// Stable numeric tag used when hashing.
    pub fn tag(self) -> u8 {
        match self {
            Corner::Hidden => 0xF0,
            Corner::Empty => 0xF1,
            Corner::Symbol(s) => s.tag(),
        }
    }
}

/// Position of a corner on a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CornerPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl CornerPosition {
    /// All four corners, in index order.
    pub const ALL: [CornerPosition; 4] = [
        CornerPosition::TopLeft,
        CornerPosition::TopRight,
        CornerPosition::BottomLeft,
        CornerPosition::BottomRight,
    ];

    /// Index into [`Side::corners`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Grid offset `(row, col)` of the cell this corner touches.
    ///
    /// Rows grow downwards, columns grow to the right.
    pub fn offset(self) -> (i32, i32) {
        match self {
            CornerPosition::TopLeft => (-1, -1),
            CornerPosition::TopRight => (-1, 1),
            CornerPosition::BottomLeft => (1, -1),
            CornerPosition::BottomRight => (1, 1),
        }
    }

    /// The corner of the neighbouring card that overlaps this one.
    pub fn opposite(self) -> CornerPosition {
        match self {
            CornerPosition::TopLeft => CornerPosition::BottomRight,
            CornerPosition::TopRight => CornerPosition::BottomLeft,
            CornerPosition::BottomLeft => CornerPosition::TopRight,
            CornerPosition::BottomRight => CornerPosition::TopLeft,
        }
    }
}

/// One face of a card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Side {
    /// Corners indexed by [`CornerPosition::index`].
    pub corners: [Corner; 4],
    /// Permanent resources printed in the middle (backs and starters).
    pub center: Vec<Kingdom>,
}

impl Side {
    /// Build a side from its corners with an empty center.
    pub fn new(corners: [Corner; 4]) -> Self {
        Self { corners, center: Vec::new() }
    }

    /// Builder-style center resources.
    pub fn with_center(mut self, center: Vec<Kingdom>) -> Self {
        self.center = center;
        self
    }

    /// Corner at a position.
    pub fn corner(&self, position: CornerPosition) -> Corner {
        self.corners[position.index()]
    }

    /// Plain back of a resource or gold card: four empty corners and the
    /// kingdom in the center.
    pub fn kingdom_back(kingdom: Kingdom) -> Self {
        Self::new([Corner::Empty; 4]).with_center(vec![kingdom])
    }
}

/// Which deck a card belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardKind {
    Resource,
    Gold,
    Starter,
}

/// A playable card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: u32,
    pub kind: CardKind,
    /// `None` for starter cards.
    pub kingdom: Option<Kingdom>,
    pub front: Side,
    pub back: Side,
    /// Points awarded when played face up.
    pub points: u32,
    /// Visible resources needed to play a gold card face up.
    pub requirement: Vec<(Kingdom, u8)>,
}

impl Card {
    /// The side shown when the card is placed with the given orientation.
    pub fn side(&self, face_up: bool) -> &Side {
        if face_up {
            &self.front
        } else {
            &self.back
        }
    }

    pub fn is_gold(&self) -> bool {
        self.kind == CardKind::Gold
    }

    pub fn is_starter(&self) -> bool {
        self.kind == CardKind::Starter
    }
}

/// A secret or common objective.
///
/// Scoring objectives at the end of the game is left to the scoring rules;
/// the session only deals them and records the player's choice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveCard {
    pub id: u32,
    pub points: u32,
    pub description: String,
}

/// The full card set a desk is built from.
#[derive(Clone, Debug, Default)]
pub struct CardSet {
    pub resource: Vec<Card>,
    pub gold: Vec<Card>,
    pub starter: Vec<Card>,
    pub objective: Vec<ObjectiveCard>,
}

impl CardSet {
    /// Resource and gold cards per kingdom.
    pub const PER_KINGDOM: u32 = 10;
    /// Number of starter cards.
    pub const STARTERS: u32 = 6;
    /// Number of objective cards.
    pub const OBJECTIVES: u32 = 16;

    /// Generate the standard set: 40 resource, 40 gold, 6 starter and
    /// 16 objective cards.
    pub fn standard() -> Self {
        let mut set = CardSet::default();
        let mut next_id = 1u32;

        for kingdom in KINGDOMS {
            for n in 0..Self::PER_KINGDOM {
                set.resource.push(resource_card(next_id, kingdom, n));
                next_id += 1;
            }
        }

        for kingdom in KINGDOMS {
            for n in 0..Self::PER_KINGDOM {
                set.gold.push(gold_card(next_id, kingdom, n));
                next_id += 1;
            }
        }

        for n in 0..Self::STARTERS {
            set.starter.push(starter_card(next_id, n));
            next_id += 1;
        }

        for n in 0..Self::OBJECTIVES {
            set.objective.push(objective_card(next_id, n));
            next_id += 1;
        }

        set
    }
}

fn resource_card(id: u32, kingdom: Kingdom, n: u32) -> Card {
    let mut corners = [Corner::Symbol(Symbol::Kingdom(kingdom)); 4];
    corners[(n % 4) as usize] = Corner::Hidden;
    if n >= 5 {
        let third = ((n + 2) % 4) as usize;
        corners[third] = Corner::Symbol(Symbol::Item(ITEMS[(n % 3) as usize]));
    } else {
        corners[((n + 1) % 4) as usize] = Corner::Empty;
    }

    Card {
        id,
        kind: CardKind::Resource,
        kingdom: Some(kingdom),
        front: Side::new(corners),
        back: Side::kingdom_back(kingdom),
        points: if n >= 7 { 1 } else { 0 },
        requirement: Vec::new(),
    }
}

fn gold_card(id: u32, kingdom: Kingdom, n: u32) -> Card {
    const POINTS: [u32; 10] = [1, 1, 1, 2, 2, 2, 3, 3, 5, 5];

    let mut corners = [Corner::Empty; 4];
    corners[((n + 1) % 4) as usize] = Corner::Hidden;
    if n % 2 == 0 {
        corners[((n + 3) % 4) as usize] = Corner::Symbol(Symbol::Item(ITEMS[(n % 3) as usize]));
    }

    Card {
        id,
        kind: CardKind::Gold,
        kingdom: Some(kingdom),
        front: Side::new(corners),
        back: Side::kingdom_back(kingdom),
        points: POINTS[n as usize],
        requirement: vec![(kingdom, 2 + (n % 3) as u8)],
    }
}

fn starter_card(id: u32, n: u32) -> Card {
    let primary = KINGDOMS[(n % 4) as usize];
    let secondary = KINGDOMS[((n + 1) % 4) as usize];

    let mut front_corners = [Corner::Empty; 4];
    front_corners[0] = Corner::Symbol(Symbol::Kingdom(primary));
    front_corners[3] = Corner::Symbol(Symbol::Kingdom(secondary));
    let mut center = vec![primary];
    if n >= 4 {
        center.push(secondary);
    }

    let back_corners = [
        Corner::Symbol(Symbol::Kingdom(KINGDOMS[(n % 4) as usize])),
        Corner::Symbol(Symbol::Kingdom(KINGDOMS[((n + 1) % 4) as usize])),
        Corner::Symbol(Symbol::Kingdom(KINGDOMS[((n + 2) % 4) as usize])),
        Corner::Symbol(Symbol::Kingdom(KINGDOMS[((n + 3) % 4) as usize])),
    ];

    Card {
        id,
        kind: CardKind::Starter,
        kingdom: None,
        front: Side::new(front_corners).with_center(center),
        back: Side::new(back_corners),
        points: 0,
        requirement: Vec::new(),
    }
}

fn objective_card(id: u32, n: u32) -> ObjectiveCard {
    let kingdom = KINGDOMS[(n % 4) as usize];
    let (points, description) = match n / 4 {
        0 => (2, format!("three {:?} resources", kingdom)),
        1 => (3, format!("diagonal of three {:?} cards", kingdom)),
        2 => (3, format!("{:?} column with a neighbour", kingdom)),
        _ => {
            let item = ITEMS[(n % 3) as usize];
            (2, format!("two {:?} items", item))
        }
    };

    ObjectiveCard { id, points, description }
}

// =============================================================================
// TESTS
// =============================================================================
