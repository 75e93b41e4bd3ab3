use super::board::{Board, SquareKind};
use super::cards::DeckKind;
use super::player::PlayerAccount;
use super::{GameConfig, Money, SquareId};

/// Structured result of landing on a square. The resolver is pure dispatch
/// keyed by square category; applying the outcome (payments, decision
/// windows, card effects) is the turn state machine's job.
#[derive(Debug, Clone, PartialEq)]
pub enum LandingOutcome {
    /// No side effect beyond logging.
    Nothing,
    OfferPurchase {
        square: SquareId,
        price: Money,
    },
    /// Toll owed to another player. `buyout` carries the takeover premium
    /// while the square is unlocked, and nothing once it is locked.
    TollDue {
        square: SquareId,
        owner: Box<str>,
        amount: Money,
        buyout: Option<Money>,
    },
    /// The acting player owns the square: offer a build decision.
    OfferBuild {
        square: SquareId,
    },
    TaxDue {
        amount: Money,
    },
    Draw {
        deck: DeckKind,
    },
    GoToJail,
    OfferWorldTour,
    OfferFestival,
}

/// Effective toll of a square: the table value at the current building
/// level, multiplied when the owner holds the whole group, doubled while
/// festival-boosted.
pub fn compute_toll(board: &Board, config: &GameConfig, square: SquareId) -> Money {
    let Some(sq) = board.square(square) else {
        return 0;
    };
    let mut toll = sq.toll_at_level();
    if let (Some(owner), Some(group)) = (sq.owner.as_deref(), sq.group) {
        if board.owns_entire_group(owner, group) {
            toll = toll.saturating_mul(config.group_monopoly_multiplier);
        }
    }
    if sq.boosted_turns > 0 {
        toll = toll.saturating_mul(2);
    }
    toll
}

fn allied(players: &[PlayerAccount], actor: &str, other: &str) -> bool {
    players
        .iter()
        .find(|p| &*p.name == actor)
        .map_or(false, |p| p.ally.as_deref() == Some(other))
}

/// Decides the required effect of `actor` landing on `square`.
pub fn resolve(
    board: &Board,
    players: &[PlayerAccount],
    config: &GameConfig,
    actor: &str,
    square: SquareId,
) -> LandingOutcome {
    let Some(sq) = board.square(square) else {
        return LandingOutcome::Nothing;
    };

    match sq.kind {
        SquareKind::Start | SquareKind::Jail | SquareKind::FreeRest => LandingOutcome::Nothing,
        SquareKind::GoToJail => LandingOutcome::GoToJail,
        SquareKind::Chance => LandingOutcome::Draw {
            deck: DeckKind::Chance,
        },
        SquareKind::Fate => LandingOutcome::Draw {
            deck: DeckKind::Fate,
        },
        SquareKind::Tax => LandingOutcome::TaxDue {
            amount: sq.toll_at_level(),
        },
        SquareKind::WorldTour => LandingOutcome::OfferWorldTour,
        SquareKind::Festival => {
            let owns_any = players
                .iter()
                .find(|p| &*p.name == actor)
                .map_or(false, |p| !p.owned.is_empty());
            if owns_any {
                LandingOutcome::OfferFestival
            } else {
                LandingOutcome::Nothing
            }
        }
        SquareKind::Land | SquareKind::Ferry => match sq.owner.as_deref() {
            None => LandingOutcome::OfferPurchase {
                square,
                price: sq.price,
            },
            Some(owner) if owner == actor => {
                if sq.build_eligible() {
                    LandingOutcome::OfferBuild { square }
                } else {
                    LandingOutcome::Nothing
                }
            }
            Some(owner) => {
                if sq.mortgaged || allied(players, actor, owner) {
                    return LandingOutcome::Nothing;
                }
                let buyout = (!sq.locked).then(|| config.buyout_premium(sq.price));
                LandingOutcome::TollDue {
                    square,
                    owner: owner.into(),
                    amount: compute_toll(board, config, square),
                    buyout,
                }
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::game::board::BuildingKind;

    fn setup() -> (Board, Vec<PlayerAccount>, GameConfig) {
        let config = GameConfig::default();
        let board = Board::standard();
        let players = vec![
            PlayerAccount::new("ada".into(), &config),
            PlayerAccount::new("babbage".into(), &config),
        ];
        (board, players, config)
    }

    #[test]
    fn unowned_land_offers_purchase() {
        let (board, players, config) = setup();
        assert_eq!(
            resolve(&board, &players, &config, "ada", 7),
            LandingOutcome::OfferPurchase {
                square: 7,
                price: 100
            }
        );
    }

    #[test]
    fn owned_unlocked_square_offers_buyout_alongside_toll() {
        let (mut board, mut players, config) = setup();
        board.assign_owner(7, "babbage");
        players[1].grant_ownership(7, &board);

        let outcome = resolve(&board, &players, &config, "ada", 7);
        assert_eq!(
            outcome,
            LandingOutcome::TollDue {
                square: 7,
                owner: "babbage".into(),
                amount: 20,
                buyout: Some(150),
            }
        );
    }

    #[test]
    fn locked_square_offers_no_buyout() {
        let (mut board, mut players, config) = setup();
        board.assign_owner(7, "babbage");
        players[1].grant_ownership(7, &board);
        for _ in 0..3 {
            board.add_building(7, BuildingKind::Villa, 3);
        }

        match resolve(&board, &players, &config, "ada", 7) {
            LandingOutcome::TollDue { buyout, .. } => assert_eq!(buyout, None),
            other => panic!("expected toll, got {other:?}"),
        }
    }

    #[test]
    fn monopoly_multiplies_table_toll() {
        let (mut board, mut players, config) = setup();
        for id in [6, 7] {
            board.assign_owner(id, "babbage");
            players[1].grant_ownership(id, &board);
        }
        board.add_building(7, BuildingKind::Villa, 3);
        let sq = board.square(7).unwrap();
        let expected = sq.tolls[1] * config.group_monopoly_multiplier;

        match resolve(&board, &players, &config, "ada", 7) {
            LandingOutcome::TollDue { amount, .. } => assert_eq!(amount, expected),
            other => panic!("expected toll, got {other:?}"),
        }
    }

    #[test]
    fn festival_boost_doubles_the_toll() {
        let (mut board, mut players, config) = setup();
        board.assign_owner(7, "babbage");
        players[1].grant_ownership(7, &board);
        let plain = compute_toll(&board, &config, 7);
        board.square_mut(7).unwrap().boosted_turns = 2;
        assert_eq!(compute_toll(&board, &config, 7), plain * 2);
    }

    #[test]
    fn allies_and_mortgaged_squares_collect_nothing() {
        let (mut board, mut players, config) = setup();
        board.assign_owner(7, "babbage");
        players[1].grant_ownership(7, &board);

        players[0].ally = Some("babbage".into());
        assert_eq!(
            resolve(&board, &players, &config, "ada", 7),
            LandingOutcome::Nothing
        );

        players[0].ally = None;
        board.mortgage(7);
        assert_eq!(
            resolve(&board, &players, &config, "ada", 7),
            LandingOutcome::Nothing
        );
    }

    #[test]
    fn own_square_offers_build_and_special_squares_dispatch() {
        let (mut board, mut players, config) = setup();
        board.assign_owner(7, "ada");
        players[0].grant_ownership(7, &board);

        assert_eq!(
            resolve(&board, &players, &config, "ada", 7),
            LandingOutcome::OfferBuild { square: 7 }
        );
        assert_eq!(
            resolve(&board, &players, &config, "ada", 4),
            LandingOutcome::TaxDue { amount: 100 }
        );
        assert_eq!(
            resolve(&board, &players, &config, "ada", 24),
            LandingOutcome::GoToJail
        );
        assert_eq!(
            resolve(&board, &players, &config, "ada", 30),
            LandingOutcome::OfferWorldTour
        );
        // Festival with property prompts; without property it is a no-op.
        assert_eq!(
            resolve(&board, &players, &config, "ada", 27),
            LandingOutcome::OfferFestival
        );
        assert_eq!(
            resolve(&board, &players, &config, "babbage", 27),
            LandingOutcome::Nothing
        );
    }
}
