use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Money, SquareId};

/// District a purchasable square belongs to. Owning every square of a group
/// completes it, which feeds both the monopoly toll multiplier and the
/// group-count win condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Harbor,
    Lowtown,
    Market,
    Foundry,
    Midtown,
    Parkside,
    Theater,
    Uptown,
    Crown,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Group::Harbor => "Harbor",
            Group::Lowtown => "Lowtown",
            Group::Market => "Market",
            Group::Foundry => "Foundry",
            Group::Midtown => "Midtown",
            Group::Parkside => "Parkside",
            Group::Theater => "Theater",
            Group::Uptown => "Uptown",
            Group::Crown => "Crown",
        };
        write!(f, "{name}")
    }
}

/// Category of a board square. Dispatch in the landing resolver is keyed on
/// this, one handler per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquareKind {
    Start,
    Land,
    /// River crossing: purchasable, collects a flat toll, never builds.
    Ferry,
    Tax,
    Chance,
    Fate,
    Jail,
    GoToJail,
    FreeRest,
    /// Special-move square: the player picks any destination square.
    WorldTour,
    /// Special-tax-boost square: doubles the toll of one owned square for a
    /// bounded number of turns.
    Festival,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildingKind {
    Villa,
    Hotel,
}

impl BuildingKind {
    /// Construction cost on a square with the given purchase price.
    pub fn cost(&self, price: Money) -> Money {
        match self {
            BuildingKind::Villa => price / 2,
            BuildingKind::Hotel => price,
        }
    }
}

impl fmt::Display for BuildingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildingKind::Villa => write!(f, "villa"),
            BuildingKind::Hotel => write!(f, "hotel"),
        }
    }
}

/// One construction unit on a square. An upgraded unit is the collapsed form
/// of `upgrade_threshold` base units of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    pub kind: BuildingKind,
    pub upgraded: bool,
}

/// Result of installing a building unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Installed,
    /// The threshold was reached: base units were collapsed into one upgraded
    /// unit and the square is now locked against ownership transfer.
    Upgraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Square {
    pub name: Box<str>,
    pub kind: SquareKind,
    pub group: Option<Group>,
    /// Purchase price; zero on non-purchasable squares.
    pub price: Money,
    /// Toll table indexed by building level. Slot 0 doubles as the tax
    /// amount on tax squares.
    pub tolls: Box<[Money]>,
    pub owner: Option<Box<str>>,
    pub buildings: Vec<Building>,
    pub mortgaged: bool,
    /// Set permanently once a building upgrade happens; a locked square can
    /// never change owner again.
    pub locked: bool,
    /// Remaining turns of festival toll doubling.
    pub boosted_turns: u32,
}

impl Square {
    fn bare(name: &str, kind: SquareKind) -> Self {
        Self {
            name: name.into(),
            kind,
            group: None,
            price: 0,
            tolls: Box::from([]),
            owner: None,
            buildings: Vec::new(),
            mortgaged: false,
            locked: false,
            boosted_turns: 0,
        }
    }

    fn land(name: &str, group: Group, price: Money) -> Self {
        let base = price / 5;
        let tolls = [1, 2, 4, 6, 9, 12].map(|m| base * m);
        Self {
            group: Some(group),
            price,
            tolls: Box::from(tolls),
            ..Self::bare(name, SquareKind::Land)
        }
    }

    fn ferry(name: &str, price: Money) -> Self {
        Self {
            group: Some(Group::Harbor),
            price,
            tolls: Box::from([price / 2]),
            ..Self::bare(name, SquareKind::Ferry)
        }
    }

    fn tax(name: &str, amount: Money) -> Self {
        Self {
            tolls: Box::from([amount]),
            ..Self::bare(name, SquareKind::Tax)
        }
    }

    pub fn purchasable(&self) -> bool {
        matches!(self.kind, SquareKind::Land | SquareKind::Ferry)
    }

    /// Whether construction is permitted at all on this square. Ownership
    /// and affordability are checked by the caller.
    pub fn build_eligible(&self) -> bool {
        self.kind == SquareKind::Land && !self.mortgaged
    }

    /// Building level used to index the toll table. An upgraded unit counts
    /// for four base units.
    pub fn building_level(&self) -> usize {
        self.buildings
            .iter()
            .map(|b| if b.upgraded { 4 } else { 1 })
            .sum()
    }

    /// Toll table entry for the current building level, clamped to the last
    /// entry. Zero on squares without a toll table.
    pub fn toll_at_level(&self) -> Money {
        match self.tolls.len() {
            0 => 0,
            len => self.tolls[self.building_level().min(len - 1)],
        }
    }

    /// Number of non-upgraded units of one kind currently installed.
    pub fn base_units_of(&self, kind: BuildingKind) -> usize {
        self.buildings
            .iter()
            .filter(|b| b.kind == kind && !b.upgraded)
            .count()
    }

    pub fn has_upgraded(&self, kind: BuildingKind) -> bool {
        self.buildings.iter().any(|b| b.kind == kind && b.upgraded)
    }
}

/// All common knowledge about the board: static layout plus the mutable
/// ownership, building, and flag state of every square.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    squares: Vec<Square>,
}

impl Board {
    pub const START: SquareId = 0;

    /// The standard 32-square layout. Start at 0, jail at 8, free rest at
    /// 16, go-to-jail at 24; eight two-square land groups plus three Harbor
    /// ferries.
    pub fn standard() -> Self {
        use SquareKind::*;
        let squares = vec![
            Square::bare("Start", Start),
            Square::land("Old Wharf", Group::Lowtown, 60),
            Square::land("Ropewalk", Group::Lowtown, 60),
            Square::bare("Chance", Chance),
            Square::tax("City Levy", 100),
            Square::ferry("North Ferry", 200),
            Square::land("Copper Lane", Group::Market, 90),
            Square::land("Market Row", Group::Market, 100),
            Square::bare("Jail", Jail),
            Square::land("Forge Street", Group::Foundry, 120),
            Square::bare("Fate", Fate),
            Square::land("Smelter Yard", Group::Foundry, 140),
            Square::ferry("East Ferry", 200),
            Square::land("Clock Court", Group::Midtown, 160),
            Square::land("Guild Hall", Group::Midtown, 180),
            Square::tax("Road Toll", 150),
            Square::bare("Free Rest", FreeRest),
            Square::land("Linden Walk", Group::Parkside, 200),
            Square::bare("Chance", Chance),
            Square::land("Fountain Green", Group::Parkside, 220),
            Square::ferry("South Ferry", 200),
            Square::land("Gilt Stage", Group::Theater, 240),
            Square::land("Opera Arch", Group::Theater, 260),
            Square::bare("Fate", Fate),
            Square::bare("Go To Jail", GoToJail),
            Square::land("High Terrace", Group::Uptown, 280),
            Square::land("Observatory Row", Group::Uptown, 300),
            Square::bare("Festival", Festival),
            Square::land("Palace Gate", Group::Crown, 320),
            Square::bare("Chance", Chance),
            Square::bare("World Tour", WorldTour),
            Square::land("Crown Plaza", Group::Crown, 350),
        ];
        Self { squares }
    }

    pub fn len(&self) -> usize {
        self.squares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.squares.is_empty()
    }

    pub fn square(&self, id: SquareId) -> Option<&Square> {
        self.squares.get(id)
    }

    pub fn square_mut(&mut self, id: SquareId) -> Option<&mut Square> {
        self.squares.get_mut(id)
    }

    pub fn squares(&self) -> &[Square] {
        &self.squares
    }

    /// Index of the jail square.
    pub fn jail_index(&self) -> SquareId {
        self.squares
            .iter()
            .position(|s| s.kind == SquareKind::Jail)
            .expect("standard board has a jail square")
    }

    /// Advances a token by `steps` with wrap-around. The second value is
    /// true iff the move passed (or landed on) the start square, which is
    /// the lap-bonus trigger.
    pub fn advance(&self, from: SquareId, steps: usize) -> (SquareId, bool) {
        let raw = from + steps;
        (raw % self.squares.len(), raw >= self.squares.len())
    }

    pub fn group_members(&self, group: Group) -> impl Iterator<Item = SquareId> + '_ {
        self.squares
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.group == Some(group))
            .map(|(id, _)| id)
    }

    /// Whether `owner` holds every square of `group`.
    pub fn owns_entire_group(&self, owner: &str, group: Group) -> bool {
        self.squares
            .iter()
            .filter(|s| s.group == Some(group))
            .all(|s| s.owner.as_deref() == Some(owner))
    }

    /// Every group `owner` has completed, in board order.
    pub fn completed_groups(&self, owner: &str) -> Vec<Group> {
        let mut out = Vec::new();
        for square in &self.squares {
            let Some(group) = square.group else { continue };
            if !out.contains(&group) && self.owns_entire_group(owner, group) {
                out.push(group);
            }
        }
        out
    }

    /// Assigns a freshly purchased square to `owner`. The caller has already
    /// validated that the square is purchasable and unowned.
    pub fn assign_owner(&mut self, id: SquareId, owner: &str) {
        if let Some(square) = self.squares.get_mut(id) {
            debug_assert!(square.owner.is_none() && square.purchasable());
            square.owner = Some(owner.into());
        }
    }

    /// Transfers an unlocked square between players, buildings intact.
    /// Returns false (and changes nothing) if the square is locked.
    pub fn transfer_owner(&mut self, id: SquareId, to: &str) -> bool {
        match self.squares.get_mut(id) {
            Some(square) if !square.locked => {
                square.owner = Some(to.into());
                true
            }
            _ => false,
        }
    }

    /// Returns a square to the bank: owner cleared, buildings demolished,
    /// flags reset. Used for bankruptcy, forfeits, and rematches.
    pub fn reset_square(&mut self, id: SquareId) {
        if let Some(square) = self.squares.get_mut(id) {
            square.owner = None;
            square.buildings.clear();
            square.mortgaged = false;
            square.locked = false;
            square.boosted_turns = 0;
        }
    }

    /// Installs one base unit of `kind`. Reaching `threshold` base units of
    /// that kind atomically replaces them with a single upgraded unit and
    /// locks the square against ownership transfer.
    pub fn add_building(
        &mut self,
        id: SquareId,
        kind: BuildingKind,
        threshold: usize,
    ) -> BuildResult {
        let square = self.squares.get_mut(id).expect("validated square id");
        square.buildings.push(Building {
            kind,
            upgraded: false,
        });

        if square.base_units_of(kind) < threshold {
            return BuildResult::Installed;
        }

        square.buildings.retain(|b| !(b.kind == kind && !b.upgraded));
        square.buildings.push(Building {
            kind,
            upgraded: true,
        });
        square.locked = true;
        BuildResult::Upgraded
    }

    /// Removes one base unit of `kind`. Upgraded units cannot be sold.
    /// Returns false if no such unit exists.
    pub fn sell_building(&mut self, id: SquareId, kind: BuildingKind) -> bool {
        let Some(square) = self.squares.get_mut(id) else {
            return false;
        };
        match square
            .buildings
            .iter()
            .position(|b| b.kind == kind && !b.upgraded)
        {
            Some(pos) => {
                square.buildings.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Flags a square as mortgaged. Locked squares cannot be mortgaged;
    /// returns false for those and for squares already mortgaged.
    pub fn mortgage(&mut self, id: SquareId) -> bool {
        match self.squares.get_mut(id) {
            Some(square) if !square.mortgaged && !square.locked => {
                square.mortgaged = true;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_wraps_at_start() {
        let board = Board::standard();
        assert_eq!(board.advance(0, 7), (7, false));
        assert_eq!(board.advance(30, 4), (2, true));
        assert_eq!(board.advance(28, 4), (0, true));
    }

    #[test]
    fn owner_null_iff_unpurchased() {
        let mut board = Board::standard();
        assert!(board.square(7).unwrap().owner.is_none());
        board.assign_owner(7, "ada");
        assert_eq!(board.square(7).unwrap().owner.as_deref(), Some("ada"));
        board.reset_square(7);
        assert!(board.square(7).unwrap().owner.is_none());
    }

    #[test]
    fn third_unit_upgrades_and_locks() {
        let mut board = Board::standard();
        board.assign_owner(7, "ada");
        assert_eq!(
            board.add_building(7, BuildingKind::Villa, 3),
            BuildResult::Installed
        );
        assert_eq!(
            board.add_building(7, BuildingKind::Villa, 3),
            BuildResult::Installed
        );
        assert_eq!(
            board.add_building(7, BuildingKind::Villa, 3),
            BuildResult::Upgraded
        );

        let square = board.square(7).unwrap();
        assert_eq!(square.buildings.len(), 1);
        assert!(square.buildings[0].upgraded);
        assert!(square.locked);

        // A locked square never changes owner again.
        assert!(!board.transfer_owner(7, "babbage"));
        assert_eq!(board.square(7).unwrap().owner.as_deref(), Some("ada"));
    }

    #[test]
    fn upgraded_unit_reads_deep_into_toll_table() {
        let mut board = Board::standard();
        board.assign_owner(7, "ada");
        for _ in 0..3 {
            board.add_building(7, BuildingKind::Villa, 3);
        }
        let square = board.square(7).unwrap();
        assert_eq!(square.building_level(), 4);
        assert_eq!(square.toll_at_level(), square.tolls[4]);
    }

    #[test]
    fn group_completion() {
        let mut board = Board::standard();
        let members: Vec<_> = board.group_members(Group::Market).collect();
        assert_eq!(members, vec![6, 7]);

        board.assign_owner(6, "ada");
        assert!(!board.owns_entire_group("ada", Group::Market));
        board.assign_owner(7, "ada");
        assert!(board.owns_entire_group("ada", Group::Market));
        assert_eq!(board.completed_groups("ada"), vec![Group::Market]);
    }

    #[test]
    fn locked_squares_cannot_be_mortgaged() {
        let mut board = Board::standard();
        board.assign_owner(7, "ada");
        for _ in 0..3 {
            board.add_building(7, BuildingKind::Villa, 3);
        }
        assert!(!board.mortgage(7));
        assert!(!board.square(7).unwrap().mortgaged);
    }

    #[test]
    fn selling_never_removes_upgraded_units() {
        let mut board = Board::standard();
        board.assign_owner(7, "ada");
        for _ in 0..3 {
            board.add_building(7, BuildingKind::Villa, 3);
        }
        assert!(!board.sell_building(7, BuildingKind::Villa));
        board.add_building(7, BuildingKind::Hotel, 3);
        assert!(board.sell_building(7, BuildingKind::Hotel));
        assert_eq!(board.square(7).unwrap().buildings.len(), 1);
    }
}
